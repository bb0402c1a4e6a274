#![forbid(unsafe_code)]

use std::collections::HashMap;

use super::{quality_for_bitrate, AbrRule, RuleContext};
use crate::{
    options::RuleKind,
    types::{Fragment, FragmentType},
};

/// Optimization horizon in segments.
const HORIZON: f64 = 4.0;
/// Buffer level that completes the startup phase, seconds.
const BUFFER_TARGET_S: f64 = 1.5;
/// Multiplier applied to the Lagrangian on over-estimation.
const REACT: f64 = 2.0;

fn vl() -> f64 {
    HORIZON.powf(0.99)
}

fn alpha() -> f64 {
    HORIZON.max(vl() * HORIZON.sqrt())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    /// Degenerate one-rung ladder: every decision returns the current level.
    OneBitrate,
    /// Throughput-following warm-up until the buffer reaches its target.
    Startup,
    /// Online-learning steady state.
    Steady,
}

#[derive(Debug)]
struct L2AState {
    phase: Phase,
    /// Lagrangian multiplier.
    q: f64,
    /// Probability vector over the ladder.
    w: Vec<f64>,
    prev_w: Vec<f64>,
    last_quality: usize,
    last_segment_duration_s: Option<f64>,
}

impl L2AState {
    fn new(ladder_len: usize) -> Self {
        let phase = if ladder_len < 2 {
            Phase::OneBitrate
        } else {
            Phase::Startup
        };
        Self {
            phase,
            q: 0.0,
            w: vec![0.0; ladder_len],
            prev_w: vec![0.0; ladder_len],
            last_quality: 0,
            last_segment_duration_s: None,
        }
    }
}

/// Project a vector onto the probability simplex (Duchi et al., the
/// O(n log n) sort-based algorithm). The result has non-negative components
/// summing to 1 and is the closest such vector in the `l2` norm.
pub(crate) fn project_simplex(v: &[f64]) -> Vec<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (j, &s) in sorted.iter().enumerate() {
        cumsum += s;
        #[allow(clippy::cast_precision_loss)]
        let candidate = (cumsum - 1.0) / (j as f64 + 1.0);
        if s - candidate > 0.0 {
            theta = candidate;
        }
    }

    v.iter().map(|&x| (x - theta).max(0.0)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).fold(0.0, |acc, (x, y)| acc + x * y)
}

/// Online-learning rule driven by a Lagrangian multiplier and projection
/// onto the probability simplex.
///
/// Keeps one state machine per media type; a stalled buffer resets the
/// affected machines back to startup.
#[derive(Debug, Default)]
pub struct L2ARule {
    states: HashMap<FragmentType, L2AState>,
}

impl L2ARule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn startup(state: &mut L2AState, ctx: &RuleContext<'_>) -> usize {
        if ctx.live {
            if let Some(latency) = ctx.latency {
                if ctx.frag_duration > 0.0
                    && (latency - ctx.target_latency).abs() >= ctx.frag_duration
                {
                    // Too far off the live edge for the estimate to mean
                    // anything; abstain until the drift closes.
                    return ctx.clamped_current();
                }
            }
        }

        let quality = quality_for_bitrate(
            ctx.levels,
            ctx.throughput_kbps,
            ctx.latency,
            ctx.target_latency,
            ctx.frag_duration,
        );
        state.last_quality = quality;

        if state.last_segment_duration_s.is_some() && ctx.buffer_len >= BUFFER_TARGET_S {
            state.phase = Phase::Steady;
            state.q = vl();
            state.prev_w = vec![0.0; ctx.levels.len()];
            state.prev_w[quality] = 1.0;
            tracing::debug!(quality, q = state.q, "l2a startup complete");
        }

        quality
    }

    fn steady(state: &mut L2AState, ctx: &RuleContext<'_>) -> usize {
        let v = state
            .last_segment_duration_s
            .unwrap_or(ctx.frag_duration)
            .max(f64::MIN_POSITIVE);
        let t = ctx.throughput_kbps.max(1.0);
        let r = ctx.playback_rate;
        #[allow(clippy::cast_precision_loss)]
        let bitrates: Vec<f64> = ctx
            .levels
            .iter()
            .map(|l| l.bitrate as f64 / 1000.0)
            .collect();

        let alpha = alpha();
        let vl = vl();
        for i in 0..bitrates.len() {
            let sign = if r * bitrates[i] > t { -1.0 } else { 1.0 };
            state.w[i] =
                state.prev_w[i] + sign * (v / (2.0 * alpha)) * (state.q + vl) * (r * bitrates[i] / t);
        }

        let w = project_simplex(&state.w);
        let diff: Vec<f64> = w
            .iter()
            .zip(&state.prev_w)
            .map(|(new, old)| new - old)
            .collect();
        state.prev_w.copy_from_slice(&w);
        state.w.copy_from_slice(&w);

        state.q = (state.q - v + v * r * ((dot(&bitrates, &state.prev_w) + dot(&bitrates, &diff)) / t))
            .max(0.0);

        let target = dot(&bitrates, &w);
        let mut quality = 0;
        let mut best = f64::INFINITY;
        for (i, &b) in bitrates.iter().enumerate() {
            let distance = (b - target).abs();
            if distance < best {
                best = distance;
                quality = i;
            }
        }

        // One-step ascent: never jump more than one rung up when the next
        // rung already fits the measured throughput.
        if quality > state.last_quality && bitrates[state.last_quality + 1] <= t {
            quality = state.last_quality + 1;
        }

        // Provision against over-estimation: recalibrate the multiplier so
        // the next update leans conservative.
        if bitrates[quality] >= t {
            state.q = REACT * vl.max(state.q);
        }

        state.last_quality = quality;
        tracing::debug!(quality, q = state.q, target_kbps = target, "l2a steady decision");
        quality
    }
}

impl AbrRule for L2ARule {
    fn kind(&self) -> RuleKind {
        RuleKind::L2A
    }

    fn next_quality(&mut self, ctx: &RuleContext<'_>) -> usize {
        let state = self
            .states
            .entry(ctx.frag_type)
            .or_insert_with(|| L2AState::new(ctx.levels.len()));

        if ctx.levels.len() < 2 {
            state.phase = Phase::OneBitrate;
            return ctx.clamped_current();
        }
        if state.w.len() != ctx.levels.len() {
            // Ladder changed shape (or grew out of the degenerate case):
            // restart learning but keep the per-segment accounting.
            let duration = state.last_segment_duration_s;
            *state = L2AState::new(ctx.levels.len());
            state.last_segment_duration_s = duration;
        }

        match state.phase {
            Phase::OneBitrate => ctx.clamped_current(),
            Phase::Startup => Self::startup(state, ctx),
            Phase::Steady => Self::steady(state, ctx),
        }
    }

    fn on_fragment_parsed(&mut self, frag: &Fragment) {
        if frag.duration > 0.0 {
            if let Some(state) = self.states.get_mut(&frag.frag_type) {
                state.last_segment_duration_s = Some(frag.duration);
            } else {
                let mut state = L2AState::new(0);
                state.last_segment_duration_s = Some(frag.duration);
                self.states.insert(frag.frag_type, state);
            }
        }
    }

    fn on_stall(&mut self) {
        for state in self.states.values_mut() {
            state.phase = if state.w.len() < 2 {
                Phase::OneBitrate
            } else {
                Phase::Startup
            };
            state.q = 0.0;
            state.last_segment_duration_s = None;
        }
    }
}
