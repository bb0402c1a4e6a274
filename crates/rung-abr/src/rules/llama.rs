#![forbid(unsafe_code)]

use std::collections::VecDeque;

use super::{AbrRule, RuleContext};
use crate::{options::RuleKind, types::FragmentType};

/// Throughput samples kept for the harmonic mean.
const WINDOW: usize = 10;
/// Safety factor applied to the harmonic mean.
const SAFETY_FACTOR: f64 = 1.0;
/// Fragments skipped after session start before decisions begin.
const WARMUP_FRAGMENTS: u64 = 5;

/// Harmonic-mean throughput heuristic with one-step hysteresis.
///
/// Down-switches follow the last measured throughput immediately;
/// up-switches additionally need the harmonic mean of the recent window
/// above the next rung, so one fast fragment does not trigger a climb.
#[derive(Debug, Default)]
pub struct LlamaRule {
    /// Reciprocals of recent throughputs, oldest first.
    reciprocals: VecDeque<f64>,
    /// First sequence number seen this session.
    sn0: Option<u64>,
}

impl LlamaRule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn harmonic_mean_bps(&self) -> f64 {
        let sum: f64 = self.reciprocals.iter().sum();
        if sum > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.reciprocals.len() as f64 / sum * SAFETY_FACTOR
            }
        } else {
            0.0
        }
    }
}

impl AbrRule for LlamaRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Llama
    }

    fn next_quality(&mut self, ctx: &RuleContext<'_>) -> usize {
        let current = ctx.clamped_current();
        if ctx.frag_type != FragmentType::Main || ctx.levels.len() < 2 {
            return current;
        }

        let last_tp_bps = ctx.throughput_kbps * 1000.0;
        if last_tp_bps > 0.0 {
            self.reciprocals.push_back(1.0 / last_tp_bps);
            if self.reciprocals.len() > WINDOW {
                self.reciprocals.pop_front();
            }
        }

        let Some(sn) = ctx.frag_sn else {
            return current;
        };
        let sn0 = *self.sn0.get_or_insert(sn);
        if sn.abs_diff(sn0) < WARMUP_FRAGMENTS {
            return current;
        }

        #[allow(clippy::cast_precision_loss)]
        let current_bitrate = ctx.levels[current].bitrate as f64;
        if last_tp_bps < current_bitrate {
            let next = current.saturating_sub(1);
            tracing::debug!(current, next, last_tp_bps, "llama down-switch");
            return next;
        }

        if current + 1 < ctx.levels.len() {
            #[allow(clippy::cast_precision_loss)]
            let next_bitrate = ctx.levels[current + 1].bitrate as f64;
            let harmonic = self.harmonic_mean_bps();
            // The original buffer gate compares against -1 s, which a
            // non-negative buffer always clears; kept as published.
            if harmonic > next_bitrate && last_tp_bps > next_bitrate && ctx.buffer_len >= -1.0 {
                tracing::debug!(current, harmonic, last_tp_bps, "llama up-switch");
                return current + 1;
            }
        }

        current
    }

    fn on_stall(&mut self) {
        self.sn0 = None;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::rules::test_util::{context, ladder};

    fn decide(rule: &mut LlamaRule, levels: &[crate::types::Level], params: DecideParams) -> usize {
        let mut ctx = context(levels);
        ctx.current_level = params.current;
        ctx.throughput_kbps = params.tp_kbps;
        ctx.frag_sn = Some(params.sn);
        ctx.buffer_len = params.buffer;
        rule.next_quality(&ctx)
    }

    struct DecideParams {
        current: usize,
        tp_kbps: f64,
        sn: u64,
        buffer: f64,
    }

    #[test]
    fn warmup_holds_current_for_five_fragments() {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        for sn in 0..5 {
            let q = decide(
                &mut rule,
                &levels,
                DecideParams {
                    current: 0,
                    tp_kbps: 1200.0,
                    sn,
                    buffer: 8.0,
                },
            );
            assert_eq!(q, 0, "fragment {sn} still in warm-up");
        }
    }

    #[test]
    fn stable_throughput_steps_up_once_and_holds() {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        let mut current = 0;
        let mut picks = Vec::new();
        for sn in 0..12 {
            current = decide(
                &mut rule,
                &levels,
                DecideParams {
                    current,
                    tp_kbps: 1200.0,
                    sn,
                    buffer: 8.0,
                },
            );
            picks.push(current);
        }
        assert_eq!(picks, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn throughput_collapse_steps_down_one_level_per_call() {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        let mut current = 0;
        // Climb to level 2 on sustained 3500 kbit/s.
        for sn in 0..7 {
            current = decide(
                &mut rule,
                &levels,
                DecideParams {
                    current,
                    tp_kbps: 3500.0,
                    sn,
                    buffer: 8.0,
                },
            );
        }
        assert_eq!(current, 2);

        // Collapse to 400 kbit/s: one step down per decision.
        current = decide(
            &mut rule,
            &levels,
            DecideParams {
                current,
                tp_kbps: 400.0,
                sn: 7,
                buffer: 8.0,
            },
        );
        assert_eq!(current, 1);
        current = decide(
            &mut rule,
            &levels,
            DecideParams {
                current,
                tp_kbps: 400.0,
                sn: 8,
                buffer: 8.0,
            },
        );
        assert_eq!(current, 0);
    }

    #[test]
    fn up_switch_needs_harmonic_mean_not_just_last_sample() {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        // Window full of slow samples.
        for sn in 0..8 {
            decide(
                &mut rule,
                &levels,
                DecideParams {
                    current: 0,
                    tp_kbps: 400.0,
                    sn,
                    buffer: 8.0,
                },
            );
        }
        // One fast sample: last throughput clears the next rung but the
        // harmonic mean does not.
        let q = decide(
            &mut rule,
            &levels,
            DecideParams {
                current: 0,
                tp_kbps: 5000.0,
                sn: 8,
                buffer: 8.0,
            },
        );
        assert_eq!(q, 0);
    }

    #[rstest]
    #[case::audio(FragmentType::Audio)]
    #[case::subtitle(FragmentType::Subtitle)]
    fn non_main_types_hold_current(#[case] frag_type: FragmentType) {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        let mut ctx = context(&levels);
        ctx.current_level = 2;
        ctx.throughput_kbps = 100.0;
        ctx.frag_sn = Some(20);
        ctx.frag_type = frag_type;
        assert_eq!(rule.next_quality(&ctx), 2);
    }

    #[test]
    fn stall_restarts_warmup() {
        let levels = ladder();
        let mut rule = LlamaRule::new();
        for sn in 0..8 {
            decide(
                &mut rule,
                &levels,
                DecideParams {
                    current: 0,
                    tp_kbps: 1200.0,
                    sn,
                    buffer: 8.0,
                },
            );
        }
        rule.on_stall();
        // First decision after the stall re-seeds sn0 and holds.
        let q = decide(
            &mut rule,
            &levels,
            DecideParams {
                current: 1,
                tp_kbps: 1200.0,
                sn: 100,
                buffer: 8.0,
            },
        );
        assert_eq!(q, 1);
    }

    #[test]
    fn one_level_ladder_degenerates_to_current() {
        let levels = vec![crate::types::Level::new(800_000, "avc1")];
        let mut rule = LlamaRule::new();
        let q = decide(
            &mut rule,
            &levels,
            DecideParams {
                current: 0,
                tp_kbps: 100.0,
                sn: 9,
                buffer: 8.0,
            },
        );
        assert_eq!(q, 0);
    }
}
