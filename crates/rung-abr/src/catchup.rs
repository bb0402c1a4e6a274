#![forbid(unsafe_code)]

use crate::options::CatchupOptions;

/// Steepness of the sigmoid mapping drift to a rate correction.
const DRIFT_GAIN: f64 = 5.0;
/// Drift within this fraction of the target latency counts as on-target.
const DEAD_ZONE_RATIO: f64 = 0.02;

/// Computes the live catch-up playback-rate correction.
///
/// When the session is near the live edge but drifting, the rate is bent
/// along a sigmoid of the drift, clamped to `1 ± playback_rate`. A starved
/// buffer takes priority and slows playback down instead.
#[derive(Clone, Debug)]
pub struct CatchupController {
    options: CatchupOptions,
}

impl CatchupController {
    #[must_use]
    pub fn new(options: CatchupOptions) -> Self {
        Self { options }
    }

    /// New playback rate, or `None` when no change should be written.
    #[must_use]
    pub fn playback_rate(
        &self,
        current_latency: f64,
        target_latency: f64,
        buffer_level: f64,
        current_rate: f64,
        playing: bool,
    ) -> Option<f64> {
        let opts = &self.options;
        if !opts.enabled || !playing {
            return None;
        }
        if current_latency > opts.latency_threshold {
            return None;
        }

        let drift = current_latency - target_latency;
        let buffer_starved = buffer_level < opts.playback_buffer_min;
        if drift.abs() <= opts.min_drift && !buffer_starved {
            return None;
        }

        let cpr = opts.playback_rate;
        let new_rate = if buffer_starved {
            let d = DRIFT_GAIN * (buffer_level - opts.playback_buffer_min);
            sigmoid_rate(cpr, d)
        } else if drift.abs() <= DEAD_ZONE_RATIO * target_latency {
            1.0
        } else {
            sigmoid_rate(cpr, DRIFT_GAIN * drift)
        };

        if (new_rate - current_rate).abs() < opts.min_rate_change {
            return None;
        }
        tracing::debug!(current_latency, buffer_level, new_rate, "catch-up rate");
        Some(new_rate)
    }
}

fn sigmoid_rate(cpr: f64, d: f64) -> f64 {
    let rate = 1.0 - cpr + 2.0 * cpr / (1.0 + (-d).exp());
    rate.clamp(1.0 - cpr, 1.0 + cpr)
}
