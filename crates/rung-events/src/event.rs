#![forbid(unsafe_code)]

use crate::{AbrEvent, TelemetryEvent};

/// Unified event for the engine.
///
/// Hierarchical: each subsystem has its own variant with a sub-enum.
#[derive(Clone, Debug)]
pub enum Event {
    /// Adaptation decision event.
    Abr(AbrEvent),
    /// Observability measurement.
    Telemetry(TelemetryEvent),
}

impl From<AbrEvent> for Event {
    fn from(e: AbrEvent) -> Self {
        Self::Abr(e)
    }
}

impl From<TelemetryEvent> for Event {
    fn from(e: TelemetryEvent) -> Self {
        Self::Telemetry(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SwitchReason;

    #[test]
    fn abr_event_into_event() {
        let event: Event = AbrEvent::LevelSwitched {
            from: 0,
            to: 1,
            reason: SwitchReason::Fallback,
        }
        .into();
        match event {
            Event::Abr(AbrEvent::LevelSwitched { from, to, reason }) => {
                assert_eq!(from, 0);
                assert_eq!(to, 1);
                assert_eq!(reason, SwitchReason::Fallback);
            }
            _ => panic!("expected Abr(LevelSwitched)"),
        }
    }

    #[test]
    fn telemetry_event_into_event() {
        let event: Event = TelemetryEvent::PlaybackRateChanged { rate: 1.2 }.into();
        assert!(matches!(
            event,
            Event::Telemetry(TelemetryEvent::PlaybackRateChanged { .. })
        ));
    }
}
