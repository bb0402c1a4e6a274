#![forbid(unsafe_code)]

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{AbrRule, RuleContext};
use crate::{
    options::RuleKind,
    qoe::QoeEvaluator,
    types::{Ladder, Level},
};

/// Latency values are normalized by this factor before entering the map.
const LATENCY_NORMALIZATION_FACTOR: f64 = 100.0;
/// Buffer floor below which a rendition is not considered safe, seconds.
const BUFFER_MIN_S: f64 = 0.3;
/// Live-edge latency target used by the weight-selector constraints.
const SELECTOR_TARGET_LATENCY_S: f64 = 1.5;
/// Gaussian neighbourhood width for SOM updates.
const SOM_SIGMA: f64 = 0.1;
/// Per-axis SOM learning rate.
const SOM_LEARNING_RATE: f64 = 0.01;
/// Margin under the measured throughput a neuron must clear, bits/s.
const THROUGHPUT_DELTA_BPS: f64 = 10_000.0;
/// Throughput-axis weight override for unsafe neurons.
const UNSAFE_NEURON_WEIGHT: f64 = 100.0;
/// Candidate values per weight axis.
const WEIGHT_VALUES: [f64; 5] = [0.2, 0.4, 0.6, 0.8, 1.0];
/// Inverse weight used when a weight is non-positive.
const INVERSE_WEIGHT_FALLBACK: f64 = 10.0;

/// How the SOM weights are chosen on each decision.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WeightSelectionMode {
    /// Fixed 0.4 on every axis.
    Manual,
    /// Xavier-style uniform draws on `[0, sqrt(2/N)]`.
    Random,
    /// Exhaustive QoE-driven search over the enumerated vectors.
    #[default]
    Dynamic,
}

/// One SOM element: a per-rung neuron with a four-axis state
/// (throughput, latency, rebuffer, switch), all normalized.
#[derive(Clone, Debug)]
struct Neuron {
    quality_index: usize,
    bitrate_bps: f64,
    state: [f64; 4],
}

fn weighted_distance(a: &[f64; 4], b: &[f64; 4], weights: &[f64; 4]) -> f64 {
    let sum: f64 = (0..4).fold(0.0, |acc, i| {
        acc + weights[i] * (a[i] - b[i]) * (a[i] - b[i])
    });
    sum.signum() * sum.abs().sqrt()
}

fn unweighted_distance(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    weighted_distance(a, b, &[1.0, 1.0, 1.0, 1.0])
}

fn inverse_weight(weight: f64) -> f64 {
    if weight > 0.0 {
        1.0 / weight
    } else {
        INVERSE_WEIGHT_FALLBACK
    }
}

/// Enumerates candidate weight vectors and picks the one maximizing
/// single-use QoE subject to buffer/latency feasibility.
#[derive(Clone, Debug)]
pub struct WeightSelector {
    options: Vec<[f64; 4]>,
    previous_latency: f64,
    target_latency: f64,
    buffer_min: f64,
    segment_duration: f64,
}

impl WeightSelector {
    #[must_use]
    pub fn new(target_latency: f64) -> Self {
        let mut options = Vec::with_capacity(WEIGHT_VALUES.len().pow(4));
        for &throughput in &WEIGHT_VALUES {
            for &latency in &WEIGHT_VALUES {
                for &buffer in &WEIGHT_VALUES {
                    for &switch in &WEIGHT_VALUES {
                        options.push([throughput, latency, buffer, switch]);
                    }
                }
            }
        }
        Self {
            options,
            previous_latency: 0.0,
            target_latency,
            buffer_min: BUFFER_MIN_S,
            segment_duration: 0.0,
        }
    }

    #[must_use]
    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    pub fn set_segment_duration(&mut self, segment_duration: f64) {
        self.segment_duration = segment_duration;
    }

    /// Buffer after hypothetically fetching one segment in `download_time`.
    fn next_buffer(&self, current_buffer: f64, download_time: f64) -> f64 {
        if download_time > self.segment_duration {
            current_buffer - self.segment_duration
        } else {
            current_buffer + self.segment_duration - download_time
        }
    }

    /// Search the enumerated vectors. Returns `None` when no neuron/vector
    /// pair satisfies the feasibility constraints (the caller keeps its
    /// previous weights).
    fn find_weight_vector(
        &mut self,
        neurons: &[Neuron],
        qoe: &QoeEvaluator,
        current_latency: f64,
        current_buffer: f64,
        current_throughput_bps: f64,
        playback_rate: f64,
    ) -> Option<[f64; 4]> {
        let delta_latency = (current_latency - self.previous_latency).abs();
        let mut best: Option<([f64; 4], f64)> = None;

        for neuron in neurons {
            let download_time =
                neuron.bitrate_bps * self.segment_duration / current_throughput_bps;
            let next_buffer = self.next_buffer(current_buffer, download_time);
            let rebuffer = (download_time - next_buffer).max(1e-5);

            if current_latency > self.target_latency + delta_latency
                || next_buffer < self.buffer_min
            {
                continue;
            }

            for weights in &self.options {
                let weighted_rebuffer = inverse_weight(weights[2]) * rebuffer;
                let weighted_latency = inverse_weight(weights[1]) * neuron.state[1];
                let total_qoe = qoe.single_use_qoe(
                    neuron.bitrate_bps / 1000.0,
                    weighted_rebuffer,
                    weighted_latency,
                    playback_rate,
                );
                if best.is_none() || best.is_some_and(|(_, q)| total_qoe > q) {
                    best = Some((*weights, total_qoe));
                }
            }
        }

        self.previous_latency = current_latency;
        best.map(|(weights, _)| weights)
    }
}

/// Self-organizing-map classifier over per-bitrate neurons.
///
/// Each ladder rung owns one neuron. A decision normalizes the measured
/// inputs, finds the best matching unit under the selected weights, nudges
/// the map toward what was observed, and returns the winner's rung.
pub struct LoLpRule {
    mode: WeightSelectionMode,
    neurons: Vec<Neuron>,
    /// Synthetic neurons built from the k-means++ centers; the weight
    /// selector evaluates candidate vectors against these.
    center_neurons: Vec<Neuron>,
    bitrate_norm: f64,
    min_bitrate_bps: f64,
    weights: [f64; 4],
    selector: WeightSelector,
    qoe: QoeEvaluator,
    rng: StdRng,
    last_qoe: Option<f64>,
}

impl LoLpRule {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_mode(seed, WeightSelectionMode::default())
    }

    #[must_use]
    pub fn with_mode(seed: u64, mode: WeightSelectionMode) -> Self {
        Self {
            mode,
            neurons: Vec::new(),
            center_neurons: Vec::new(),
            bitrate_norm: 0.0,
            min_bitrate_bps: 0.0,
            weights: [0.4; 4],
            selector: WeightSelector::new(SELECTOR_TARGET_LATENCY_S),
            qoe: QoeEvaluator::default(),
            rng: StdRng::seed_from_u64(seed),
            last_qoe: None,
        }
    }

    /// Build the map on first use (and rebuild if the ladder changed shape).
    fn ensure_neurons(&mut self, levels: &[Level]) {
        if self.neurons.len() == levels.len() {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let bitrates: Vec<f64> = levels.iter().map(|l| l.bitrate as f64).collect();
        self.bitrate_norm = bitrates.iter().map(|b| b * b).sum::<f64>().sqrt().max(1.0);
        self.min_bitrate_bps = bitrates.iter().copied().fold(f64::INFINITY, f64::min);
        self.neurons = bitrates
            .iter()
            .enumerate()
            .map(|(i, &bitrate)| Neuron {
                quality_index: i,
                bitrate_bps: bitrate,
                state: [bitrate / self.bitrate_norm, 0.0, 0.0, 0.0],
            })
            .collect();

        let centers = self.initial_centers(self.neurons.len());
        self.center_neurons = centers
            .into_iter()
            .enumerate()
            .map(|(i, state)| Neuron {
                quality_index: i,
                bitrate_bps: state[0] * self.bitrate_norm,
                state,
            })
            .collect();
    }

    fn max_throughput(&self) -> f64 {
        self.neurons
            .iter()
            .map(|n| n.state[0])
            .fold(0.0, f64::max)
    }

    /// K-means++-style seeding on random synthetic points, re-sorted from
    /// the least-similar center greedily following nearest neighbours.
    fn initial_centers(&mut self, count: usize) -> Vec<[f64; 4]> {
        let max_throughput = self.max_throughput();
        let sample_count = count * count;
        let data: Vec<[f64; 4]> = (0..sample_count)
            .map(|_| {
                [
                    self.rng.gen::<f64>() * max_throughput,
                    self.rng.gen::<f64>(),
                    self.rng.gen::<f64>(),
                    self.rng.gen::<f64>(),
                ]
            })
            .collect();

        let mut centers: Vec<[f64; 4]> = vec![data[0]];
        while centers.len() < count {
            let mut next = data[0];
            let mut max_distance = f64::NEG_INFINITY;
            for point in &data {
                let closest = centers
                    .iter()
                    .map(|c| unweighted_distance(point, c))
                    .fold(f64::INFINITY, f64::min);
                if closest > max_distance {
                    max_distance = closest;
                    next = *point;
                }
            }
            centers.push(next);
        }

        // Start from the center least similar to all the others.
        let mut least_similar = 0;
        let mut max_total = f64::NEG_INFINITY;
        for (i, center) in centers.iter().enumerate() {
            let total: f64 = centers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, other)| unweighted_distance(center, other))
                .sum();
            if total > max_total {
                max_total = total;
                least_similar = i;
            }
        }

        let mut sorted = vec![centers.remove(least_similar)];
        while !centers.is_empty() {
            let last = sorted[sorted.len() - 1];
            let mut min_index = 0;
            let mut min_distance = f64::INFINITY;
            for (i, center) in centers.iter().enumerate() {
                let distance = unweighted_distance(&last, center);
                if distance < min_distance {
                    min_distance = distance;
                    min_index = i;
                }
            }
            sorted.push(centers.remove(min_index));
        }
        sorted
    }

    /// Highest-bitrate neuron strictly below the current one that still fits
    /// the measured throughput; the current neuron when none qualifies.
    fn down_shift(&self, current: usize, throughput_bps: f64) -> usize {
        let current_bitrate = self.neurons[current].bitrate_bps;
        let mut result = current;
        let mut best_bitrate = 0.0;
        for neuron in &self.neurons {
            if neuron.bitrate_bps < current_bitrate
                && neuron.bitrate_bps > best_bitrate
                && throughput_bps > neuron.bitrate_bps
            {
                best_bitrate = neuron.bitrate_bps;
                result = neuron.quality_index;
            }
        }
        result
    }

    fn xavier_weights(&mut self) -> [f64; 4] {
        let upper = (2.0_f64 / 4.0).sqrt();
        let mut weights = [0.0; 4];
        for w in &mut weights {
            *w = self.rng.gen::<f64>() * upper;
        }
        weights
    }

    /// Nudge every neuron toward `observed`, scaled by a Gaussian kernel
    /// centered on the winner's throughput coordinate.
    fn update_neurons(&mut self, winner: usize, observed: [f64; 4]) {
        let winner_throughput = self.neurons[winner].state[0];
        for neuron in &mut self.neurons {
            let distance = neuron.state[0] - winner_throughput;
            let neighbourhood = (-(distance * distance) / (2.0 * SOM_SIGMA * SOM_SIGMA)).exp();
            for axis in 0..4 {
                neuron.state[axis] +=
                    (observed[axis] - neuron.state[axis]) * SOM_LEARNING_RATE * neighbourhood;
            }
        }
    }
}

impl AbrRule for LoLpRule {
    fn kind(&self) -> RuleKind {
        RuleKind::LoLp
    }

    fn next_quality(&mut self, ctx: &RuleContext<'_>) -> usize {
        let current = ctx.clamped_current();
        if ctx.levels.len() < 2 || ctx.frag_duration <= 0.0 {
            return current;
        }
        let throughput_bps = ctx.throughput_kbps * 1000.0;
        if !throughput_bps.is_finite() || throughput_bps <= 0.0 {
            return current;
        }

        self.ensure_neurons(ctx.levels);
        let latency = ctx.latency.unwrap_or(0.0);

        self.qoe.setup_per_segment(
            ctx.frag_duration,
            ctx.levels.max_bitrate_kbps(),
            ctx.levels.min_bitrate_kbps(),
        );
        self.selector.set_segment_duration(ctx.frag_duration);

        let mut throughput_norm = throughput_bps / self.bitrate_norm;
        if throughput_norm > 1.0 {
            throughput_norm = self.max_throughput();
        }
        let latency_norm = latency / LATENCY_NORMALIZATION_FACTOR;

        let current_bitrate = self.neurons[current].bitrate_bps;
        let download_time = current_bitrate * ctx.frag_duration / throughput_bps;
        let rebuffer = (download_time - ctx.buffer_len).max(0.0);

        self.qoe.log_segment_metrics(
            current_bitrate / 1000.0,
            rebuffer,
            latency,
            ctx.playback_rate,
        );
        self.last_qoe = self.qoe.total_qoe();

        // An imminent stall overrides the map entirely.
        if ctx.buffer_len - download_time < BUFFER_MIN_S {
            let quality = self.down_shift(current, throughput_bps);
            tracing::debug!(current, quality, download_time, "lolp down-shift");
            return quality;
        }

        let weights = match self.mode {
            WeightSelectionMode::Manual => [0.4; 4],
            WeightSelectionMode::Random => self.xavier_weights(),
            WeightSelectionMode::Dynamic => self
                .selector
                .find_weight_vector(
                    &self.center_neurons,
                    &self.qoe,
                    latency,
                    ctx.buffer_len,
                    throughput_bps,
                    ctx.playback_rate,
                )
                .unwrap_or(self.weights),
        };
        self.weights = weights;

        let target = [throughput_norm, 0.0, 0.0, 0.0];
        let mut winner = current;
        let mut min_distance = f64::INFINITY;
        for (i, neuron) in self.neurons.iter().enumerate() {
            let mut distance_weights = weights;
            let neuron_download = neuron.bitrate_bps * ctx.frag_duration / throughput_bps;
            let next_buffer = self.selector.next_buffer(ctx.buffer_len, neuron_download);
            let unsafe_neuron = neuron.bitrate_bps > throughput_bps - THROUGHPUT_DELTA_BPS
                || next_buffer < BUFFER_MIN_S;
            if unsafe_neuron && (neuron.bitrate_bps - self.min_bitrate_bps).abs() > f64::EPSILON {
                distance_weights[0] = UNSAFE_NEURON_WEIGHT;
            }
            let distance = weighted_distance(&neuron.state, &target, &distance_weights);
            if distance < min_distance {
                min_distance = distance;
                winner = i;
            }
        }

        let switched = if winner == current { 0.0 } else { 1.0 };
        self.update_neurons(current, [throughput_norm, latency_norm, rebuffer, switched]);
        self.update_neurons(winner, [throughput_norm, 0.0, 0.0, 0.0]);

        let quality = self.neurons[winner].quality_index;
        tracing::debug!(current, quality, throughput_norm, "lolp decision");
        quality
    }

    fn last_qoe(&self) -> Option<f64> {
        self.last_qoe
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::rules::test_util::{context, ladder};

    #[test]
    fn selector_enumerates_exactly_625_vectors() {
        let selector = WeightSelector::new(SELECTOR_TARGET_LATENCY_S);
        assert_eq!(selector.option_count(), 625);
        for option in &selector.options {
            for w in option {
                assert!(WEIGHT_VALUES.iter().any(|v| (v - w).abs() < 1e-12));
            }
        }
    }

    fn rule_with_map(levels: &[Level]) -> LoLpRule {
        let mut rule = LoLpRule::new(7);
        rule.ensure_neurons(levels);
        rule
    }

    fn qoe_for(levels: &[Level]) -> QoeEvaluator {
        let mut qoe = QoeEvaluator::default();
        qoe.setup_per_segment(2.0, levels.max_bitrate_kbps(), levels.min_bitrate_kbps());
        qoe
    }

    #[test]
    fn selector_returns_an_enumerated_vector_when_feasible() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let qoe = qoe_for(&levels);
        rule.selector.set_segment_duration(2.0);

        let found = rule
            .selector
            .find_weight_vector(&rule.center_neurons, &qoe, 1.0, 8.0, 2_000_000.0, 1.0)
            .expect("feasible state must yield a vector");
        let selector = WeightSelector::new(SELECTOR_TARGET_LATENCY_S);
        assert!(selector.options.contains(&found));
    }

    #[test]
    fn selector_signals_infeasibility_with_none() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let qoe = qoe_for(&levels);
        rule.selector.set_segment_duration(2.0);

        // First call records the latency; with zero drift afterwards, any
        // latency above the target fails feasibility for every neuron.
        let primed = rule.selector.find_weight_vector(
            &rule.center_neurons,
            &qoe,
            5.0,
            8.0,
            2_000_000.0,
            1.0,
        );
        assert!(primed.is_some());

        let found = rule.selector.find_weight_vector(
            &rule.center_neurons,
            &qoe,
            5.0,
            8.0,
            2_000_000.0,
            1.0,
        );
        assert!(found.is_none());
    }

    #[test]
    fn map_is_seeded_per_rung() {
        let levels = ladder();
        let rule = rule_with_map(&levels);
        assert_eq!(rule.neurons.len(), 4);
        assert_eq!(rule.center_neurons.len(), 4);
        // Initial throughput coordinates are the normalized bitrates.
        let norm = rule.bitrate_norm;
        for (i, neuron) in rule.neurons.iter().enumerate() {
            assert_eq!(neuron.quality_index, i);
            assert!((neuron.state[0] - neuron.bitrate_bps / norm).abs() < 1e-12);
        }
    }

    #[test]
    fn fresh_map_picks_highest_safe_rung() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let mut ctx = context(&levels);
        ctx.current_level = 0;
        ctx.throughput_kbps = 1600.0;
        ctx.buffer_len = 8.0;
        // 1500 kbit/s is the highest rung clearing the throughput margin.
        assert_eq!(rule.next_quality(&ctx), 2);
    }

    #[test]
    fn imminent_stall_down_shifts_below_throughput() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let mut ctx = context(&levels);
        ctx.current_level = 2;
        ctx.throughput_kbps = 1500.0;
        ctx.buffer_len = 0.4;
        // Download of a 2 s segment at parity throughput takes 2 s; the
        // buffer cannot cover it, so the rule bails to the rung below.
        assert_eq!(rule.next_quality(&ctx), 1);
    }

    #[test]
    fn decisions_are_reproducible_for_a_seed() {
        let levels = ladder();
        let run = |seed: u64| {
            let mut rule = LoLpRule::with_mode(seed, WeightSelectionMode::Random);
            let mut picks = Vec::new();
            for i in 0..6 {
                let mut ctx = context(&levels);
                ctx.current_level = picks.last().copied().unwrap_or(0);
                ctx.throughput_kbps = 1200.0 + f64::from(i) * 10.0;
                picks.push(rule.next_quality(&ctx));
            }
            picks
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn infeasible_selector_keeps_previous_weights() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let mut ctx = context(&levels);
        ctx.current_level = 0;
        ctx.throughput_kbps = 2000.0;
        ctx.buffer_len = 8.0;
        ctx.latency = Some(5.0);

        // First decision is feasible (latency drift covers the excess) and
        // sets the weights; the repeat sees zero drift with latency far over
        // target, the search comes back empty and the weights stay put.
        rule.next_quality(&ctx);
        let before = rule.weights;
        rule.next_quality(&ctx);
        assert_eq!(rule.weights, before);
    }

    #[rstest]
    #[case(f64::NAN)]
    #[case(0.0)]
    #[case(-100.0)]
    fn bad_throughput_holds_current(#[case] tp_kbps: f64) {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        let mut ctx = context(&levels);
        ctx.current_level = 1;
        ctx.throughput_kbps = tp_kbps;
        assert_eq!(rule.next_quality(&ctx), 1);
    }

    #[test]
    fn qoe_is_surfaced_after_a_decision() {
        let levels = ladder();
        let mut rule = rule_with_map(&levels);
        assert!(rule.last_qoe().is_none());
        let mut ctx = context(&levels);
        ctx.throughput_kbps = 1600.0;
        rule.next_quality(&ctx);
        assert!(rule.last_qoe().is_some());
    }
}
