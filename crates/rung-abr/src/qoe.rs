#![forbid(unsafe_code)]

/// One bucket of the piecewise-linear latency penalty schedule. The first
/// bucket whose `threshold` is at or above the current latency applies.
#[derive(Clone, Copy, Debug)]
pub struct LatencyPenaltyTier {
    pub threshold: f64,
    pub penalty_per_second: f64,
}

/// Per-segment QoE accumulator.
#[derive(Clone, Debug)]
pub struct QoeInfo {
    /// Bitrate of the previous logged segment, kbit/s.
    pub last_bitrate_kbps: Option<f64>,
    pub bitrate_reward: f64,
    pub bitrate_switch_penalty: f64,
    pub rebuffer_penalty: f64,
    pub latency_penalties: Vec<LatencyPenaltyTier>,
    pub playback_speed_penalty: f64,

    pub bitrate_sum: f64,
    pub bitrate_switch_sum: f64,
    pub rebuffer_sum: f64,
    pub latency_sum: f64,
    pub playback_speed_sum: f64,
    pub total_qoe: f64,
}

impl QoeInfo {
    fn new(segment_duration: f64, max_kbps: f64, min_kbps: f64) -> Self {
        Self {
            last_bitrate_kbps: None,
            bitrate_reward: segment_duration,
            bitrate_switch_penalty: 1.0,
            rebuffer_penalty: max_kbps,
            latency_penalties: vec![
                LatencyPenaltyTier {
                    threshold: 1.1,
                    penalty_per_second: min_kbps * 0.05,
                },
                LatencyPenaltyTier {
                    threshold: f64::INFINITY,
                    penalty_per_second: max_kbps * 0.1,
                },
            ],
            playback_speed_penalty: min_kbps,
            bitrate_sum: 0.0,
            bitrate_switch_sum: 0.0,
            rebuffer_sum: 0.0,
            latency_sum: 0.0,
            playback_speed_sum: 0.0,
            total_qoe: 0.0,
        }
    }

    fn latency_penalty(&self, latency: f64) -> f64 {
        self.latency_penalties
            .iter()
            .find(|tier| tier.threshold >= latency)
            .map_or(0.0, |tier| tier.penalty_per_second)
    }

    fn log_segment(&mut self, bitrate_kbps: f64, rebuffer_s: f64, latency_s: f64, speed: f64) {
        self.bitrate_sum += self.bitrate_reward * bitrate_kbps;
        if let Some(last) = self.last_bitrate_kbps {
            self.bitrate_switch_sum += self.bitrate_switch_penalty * (bitrate_kbps - last).abs();
        }
        self.last_bitrate_kbps = Some(bitrate_kbps);
        self.rebuffer_sum += self.rebuffer_penalty * rebuffer_s;
        self.latency_sum += self.latency_penalty(latency_s) * latency_s;
        self.playback_speed_sum += self.playback_speed_penalty * (1.0 - speed).abs();

        self.total_qoe = self.bitrate_sum
            - self.bitrate_switch_sum
            - self.rebuffer_sum
            - self.latency_sum
            - self.playback_speed_sum;
    }
}

/// Computes a per-segment QoE scalar from bitrate, rebuffer, latency and
/// playback-rate deviation.
#[derive(Clone, Debug, Default)]
pub struct QoeEvaluator {
    info: Option<QoeInfo>,
    segment_duration: f64,
    max_kbps: f64,
    min_kbps: f64,
}

impl QoeEvaluator {
    /// Start a fresh per-segment accumulation with the ladder bounds.
    pub fn setup_per_segment(&mut self, segment_duration: f64, max_kbps: f64, min_kbps: f64) {
        self.segment_duration = segment_duration;
        self.max_kbps = max_kbps;
        self.min_kbps = min_kbps;
        self.info = Some(QoeInfo::new(segment_duration, max_kbps, min_kbps));
    }

    /// Log the metrics of one played segment into the running accumulation.
    pub fn log_segment_metrics(
        &mut self,
        bitrate_kbps: f64,
        rebuffer_s: f64,
        latency_s: f64,
        playback_speed: f64,
    ) {
        if let Some(info) = self.info.as_mut() {
            info.log_segment(bitrate_kbps, rebuffer_s, latency_s, playback_speed);
        }
    }

    /// Running total of the current accumulation.
    #[must_use]
    pub fn total_qoe(&self) -> Option<f64> {
        self.info.as_ref().map(|info| info.total_qoe)
    }

    /// Evaluate one hypothetical segment against the stored ladder bounds
    /// without touching the running accumulation.
    #[must_use]
    pub fn single_use_qoe(
        &self,
        bitrate_kbps: f64,
        rebuffer_s: f64,
        latency_s: f64,
        playback_speed: f64,
    ) -> f64 {
        let mut info = QoeInfo::new(self.segment_duration, self.max_kbps, self.min_kbps);
        info.log_segment(bitrate_kbps, rebuffer_s, latency_s, playback_speed);
        info.total_qoe
    }
}
