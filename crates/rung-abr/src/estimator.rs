#![forbid(unsafe_code)]

use std::time::Duration;

use crate::types::LoaderStats;

/// Exponentially weighted moving average with a configurable half-life.
///
/// Weights are expressed in cumulative sample-duration seconds, not wall
/// clock: a sample of weight `w` decays the previous estimate by
/// `2^(-w / half_life)`.
#[derive(Clone, Debug)]
pub struct Ewma {
    alpha: f64,
    half_life: f64,
    estimate: f64,
    total_weight: f64,
}

impl Ewma {
    #[must_use]
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: Self::alpha_for(half_life_secs),
            half_life: half_life_secs,
            estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn alpha_for(half_life_secs: f64) -> f64 {
        f64::exp(0.5_f64.ln() / half_life_secs.max(0.001))
    }

    /// Change the half-life without discarding accumulated history.
    pub fn set_half_life(&mut self, half_life_secs: f64) {
        self.half_life = half_life_secs;
        self.alpha = Self::alpha_for(half_life_secs);
    }

    #[must_use]
    pub fn half_life(&self) -> f64 {
        self.half_life
    }

    pub fn add_sample(&mut self, weight: f64, value: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.estimate = value * (1.0 - adj_alpha) + adj_alpha * self.estimate;
        self.total_weight += weight.max(0.0);
    }

    /// Current estimate with the zero-initialization bias divided out.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.estimate / zero_factor.max(1e-6)
        }
    }

    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }
}

/// Fast/slow EWMA pair over per-fragment throughput samples.
///
/// The fast average reacts to throughput changes; the slow one is what the
/// engine reports, once the fast average has seen enough weight. Until then
/// the configured default estimate stands in.
#[derive(Clone, Debug)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    default_estimate: f64,
    min_weight: f64,
    min_delay_ms: f64,
    samples: u64,
}

impl BandwidthEstimator {
    const MIN_WEIGHT: f64 = 0.001;
    const MIN_DELAY_MS: f64 = 50.0;

    #[must_use]
    pub fn new(slow_secs: f64, fast_secs: f64, default_estimate_bps: f64) -> Self {
        Self {
            fast: Ewma::new(fast_secs),
            slow: Ewma::new(slow_secs),
            default_estimate: default_estimate_bps,
            min_weight: Self::MIN_WEIGHT,
            min_delay_ms: Self::MIN_DELAY_MS,
            samples: 0,
        }
    }

    /// Feed one download measurement. Non-positive durations are rejected
    /// silently, as are non-finite ones.
    pub fn sample(&mut self, duration: Duration, bytes: u64) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        if !duration_ms.is_finite() || duration_ms <= 0.0 {
            return;
        }
        let duration_ms = duration_ms.max(self.min_delay_ms);
        #[allow(clippy::cast_precision_loss)]
        let bandwidth = 8000.0 * bytes as f64 / duration_ms;
        let weight = duration_ms / 1000.0;

        self.fast.add_sample(weight, bandwidth);
        self.slow.add_sample(weight, bandwidth);
        self.samples += 1;

        tracing::trace!(
            bytes,
            duration_ms,
            bandwidth,
            estimate = self.estimate_bps(),
            "bandwidth sample"
        );
    }

    /// True once at least one sample has been applied.
    #[must_use]
    pub fn can_estimate(&self) -> bool {
        self.fast.total_weight() >= self.min_weight
    }

    /// Slow-average estimate in bits per second, or the configured default
    /// before any sample has landed.
    #[must_use]
    pub fn estimate_bps(&self) -> f64 {
        if self.can_estimate() {
            self.slow.estimate()
        } else {
            self.default_estimate
        }
    }

    /// Switch the half-lives (live/VoD profile change) without discarding
    /// accumulated history.
    pub fn update_half_lives(&mut self, slow_secs: f64, fast_secs: f64) {
        if (self.slow.half_life() - slow_secs).abs() > f64::EPSILON {
            self.slow.set_half_life(slow_secs);
        }
        if (self.fast.half_life() - fast_secs).abs() > f64::EPSILON {
            self.fast.set_half_life(fast_secs);
        }
    }

    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

/// Derive a box-level throughput sample from chunk timings.
///
/// The first and last entries of both timing arrays are trimmed: the leading
/// chunk is dominated by request latency and the trailing one by flush
/// timing. The sample then spans from the first remaining `moof` to the last
/// remaining `mdat`, with the byte count excluding that final `mdat`.
///
/// Returns `None` when either trimmed array is empty; the caller falls back
/// to whole-response timing.
#[must_use]
pub fn box_throughput_sample(stats: &LoaderStats) -> Option<(Duration, u64)> {
    let starts = trim_ends(&stats.start_time_data)?;
    let ends = trim_ends(&stats.end_time_data)?;
    let first = starts.first()?;
    let last = ends.last()?;

    let duration = last.at.saturating_duration_since(first.at);
    if duration.is_zero() {
        return None;
    }
    let bytes = stats.box_loaded.saturating_sub(last.len);
    Some((duration, bytes))
}

fn trim_ends<T>(items: &[T]) -> Option<&[T]> {
    let trimmed = items.get(1..items.len().saturating_sub(1))?;
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
