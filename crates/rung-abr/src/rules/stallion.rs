#![forbid(unsafe_code)]

use std::collections::VecDeque;

use super::{quality_for_bitrate, AbrRule, RuleContext};
use crate::options::RuleKind;

/// Throughput samples kept in the sliding window.
const THROUGHPUT_SAMPLE_AMOUNT: usize = 3;
/// Latency samples kept in the sliding window.
const LATENCY_SAMPLE_AMOUNT: usize = 4;
/// Throughput safety margin in standard deviations (subtracted).
const THROUGHPUT_SAFETY_SIGMA: f64 = 1.0;
/// Latency safety margin in standard deviations (added).
const LATENCY_SAFETY_SIGMA: f64 = 1.25;

/// Mean-minus-k-sigma throughput rule with a mean-plus-k-sigma latency band.
///
/// Live sessions accumulate short sliding windows of throughput and latency;
/// VoD sessions pop the just-pushed values back off, so a pure-VoD run never
/// grows history and every decision works from the single fresh sample.
/// That asymmetry is how the algorithm was published.
#[derive(Debug, Default)]
pub struct StallionRule {
    throughput_window: VecDeque<f64>,
    latency_window: VecDeque<f64>,
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &VecDeque<f64>, mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

impl StallionRule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(window: &mut VecDeque<f64>, value: f64, cap: usize) {
        window.push_back(value);
        if window.len() > cap {
            window.pop_front();
        }
    }
}

impl AbrRule for StallionRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Stallion
    }

    fn next_quality(&mut self, ctx: &RuleContext<'_>) -> usize {
        let current = ctx.clamped_current();
        if ctx.levels.len() < 2 {
            return current;
        }
        if !ctx.throughput_kbps.is_finite() || ctx.throughput_kbps <= 0.0 {
            return current;
        }

        Self::push(
            &mut self.throughput_window,
            ctx.throughput_kbps,
            THROUGHPUT_SAMPLE_AMOUNT,
        );
        Self::push(
            &mut self.latency_window,
            ctx.latency.unwrap_or(0.0),
            LATENCY_SAMPLE_AMOUNT,
        );

        let tp_mean = mean(&self.throughput_window);
        let bitrate_safe = tp_mean - THROUGHPUT_SAFETY_SIGMA * std_dev(&self.throughput_window, tp_mean);
        let lat_mean = mean(&self.latency_window);
        let latency_safe = lat_mean + LATENCY_SAFETY_SIGMA * std_dev(&self.latency_window, lat_mean);

        if !ctx.live {
            // VoD keeps the windows empty: pure per-call evaluation.
            self.throughput_window.pop_back();
            self.latency_window.pop_back();
        }

        if ctx.buffer_len <= 0.0 {
            return current;
        }

        let latency = ctx.latency.map(|_| latency_safe);
        let quality = quality_for_bitrate(
            ctx.levels,
            bitrate_safe,
            latency,
            ctx.target_latency,
            ctx.frag_duration,
        );
        tracing::debug!(current, quality, bitrate_safe, latency_safe, "stallion decision");
        quality
    }
}
