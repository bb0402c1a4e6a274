#![forbid(unsafe_code)]

/// Observability events: measurements the engine surfaces but never reads
/// back into decisions.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A throughput sample was fed to the bandwidth estimator.
    ThroughputSampled { bits_per_second: f64 },
    /// Per-segment QoE total from the LoL+ evaluator.
    QoeComputed { total_qoe: f64 },
    /// The catch-up controller wrote a new playback rate.
    PlaybackRateChanged { rate: f64 },
}
