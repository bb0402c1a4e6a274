#![forbid(unsafe_code)]

//! The interchangeable decision rules.
//!
//! Each rule consumes the same [`RuleContext`] snapshot and returns the next
//! quality index. Rules own their internal state exclusively; the controller
//! creates one lazily when its tag is first used and drops it when the tag
//! changes.

mod l2a;
mod llama;
mod lolp;
mod stallion;

pub use l2a::L2ARule;
pub use llama::LlamaRule;
pub use lolp::{LoLpRule, WeightSelectionMode, WeightSelector};
pub use stallion::StallionRule;

use crate::{
    options::RuleKind,
    types::{Fragment, FragmentType, Level},
};

/// Immutable snapshot of everything a rule may look at for one decision.
///
/// Rules never hold a reference back to the controller; the controller
/// assembles this record on every call.
#[derive(Clone, Debug)]
pub struct RuleContext<'a> {
    pub levels: &'a [Level],
    /// Index the player is currently loading from.
    pub current_level: usize,
    /// Throughput of the last buffered fragment, kbit/s. Zero before the
    /// first fragment lands.
    pub throughput_kbps: f64,
    /// Distance behind the live edge, seconds. `None` for VoD.
    pub latency: Option<f64>,
    /// Live-edge latency the session steers toward, seconds.
    pub target_latency: f64,
    /// Forward buffer at the playhead, seconds.
    pub buffer_len: f64,
    pub playback_rate: f64,
    /// Duration of the fragment being decided for, seconds.
    pub frag_duration: f64,
    pub live: bool,
    pub frag_type: FragmentType,
    /// Sequence number of the last loaded fragment, when known.
    pub frag_sn: Option<u64>,
}

impl RuleContext<'_> {
    /// Current level clamped into the ladder.
    #[must_use]
    pub fn clamped_current(&self) -> usize {
        self.current_level.min(self.levels.len().saturating_sub(1))
    }
}

/// A decision rule. The controller owns exactly one at a time.
pub trait AbrRule {
    fn kind(&self) -> RuleKind;

    /// Pick the next quality index. Must return a valid index in
    /// `[0, levels.len())` for every input.
    fn next_quality(&mut self, ctx: &RuleContext<'_>) -> usize;

    /// A fragment finished parsing; rules with per-segment accounting
    /// consume its duration here.
    fn on_fragment_parsed(&mut self, frag: &Fragment) {
        let _ = frag;
    }

    /// Playback stalled on an empty buffer.
    fn on_stall(&mut self) {}

    /// Per-segment QoE of the last decision, for rules that compute one.
    fn last_qoe(&self) -> Option<f64> {
        None
    }
}

/// Highest index whose bitrate fits under the given throughput, with the
/// live dead-time adjustment.
///
/// When latency feedback is available, the drift `|latency - target|` eats
/// into the time budget of the next fragment: the effective throughput
/// shrinks by the dead-time ratio, and once the drift reaches a whole
/// fragment duration only the lowest rendition is safe.
pub(crate) fn quality_for_bitrate(
    levels: &[Level],
    throughput_kbps: f64,
    latency: Option<f64>,
    target_latency: f64,
    frag_duration: f64,
) -> usize {
    let mut effective_kbps = throughput_kbps;
    if let Some(latency) = latency {
        if frag_duration > 0.0 {
            let drift = (latency - target_latency).abs();
            if drift >= frag_duration {
                return 0;
            }
            effective_kbps *= 1.0 - drift / frag_duration;
        }
    }

    let budget_bps = effective_kbps * 1000.0;
    let mut quality = 0;
    for (i, level) in levels.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        if level.bitrate as f64 <= budget_bps {
            quality = i;
        }
    }
    quality
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::RuleContext;
    use crate::types::{FragmentType, Level};

    /// The ladder used across the rule tests: 300/750/1500/3000 kbit/s.
    pub(crate) fn ladder() -> Vec<Level> {
        [300_000_u64, 750_000, 1_500_000, 3_000_000]
            .iter()
            .map(|&b| Level::new(b, "avc1"))
            .collect()
    }

    pub(crate) fn context(levels: &[Level]) -> RuleContext<'_> {
        RuleContext {
            levels,
            current_level: 0,
            throughput_kbps: 0.0,
            latency: None,
            target_latency: 1.5,
            buffer_len: 8.0,
            playback_rate: 1.0,
            frag_duration: 2.0,
            live: false,
            frag_type: FragmentType::Main,
            frag_sn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{test_util::ladder, *};

    #[rstest]
    #[case::under_everything(100.0, 0)]
    #[case::exactly_lowest(300.0, 0)]
    #[case::mid_ladder(1200.0, 1)]
    #[case::exactly_top(3000.0, 3)]
    #[case::above_top(9000.0, 3)]
    fn picks_highest_fitting_level(#[case] tp_kbps: f64, #[case] expected: usize) {
        let levels = ladder();
        assert_eq!(
            quality_for_bitrate(&levels, tp_kbps, None, 1.5, 2.0),
            expected
        );
    }

    #[test]
    fn dead_time_shrinks_effective_throughput() {
        let levels = ladder();
        // Drift of 1 s on a 2 s fragment halves the budget: 1600 -> 800 kbps.
        let q = quality_for_bitrate(&levels, 1600.0, Some(2.5), 1.5, 2.0);
        assert_eq!(q, 1);
    }

    #[test]
    fn full_fragment_drift_forces_lowest() {
        let levels = ladder();
        let q = quality_for_bitrate(&levels, 9000.0, Some(3.6), 1.5, 2.0);
        assert_eq!(q, 0);
    }
}
