#![forbid(unsafe_code)]

/// Adaptation rule selection tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleKind {
    /// Self-organizing-map classifier with dynamic weight selection.
    LoLp,
    /// Online-learning rule with a Lagrangian multiplier.
    L2A,
    /// Mean-minus-k-sigma throughput rule with a latency safety band.
    Stallion,
    /// Harmonic-mean throughput heuristic with hysteresis.
    Llama,
}

impl RuleKind {
    /// Parse a configuration tag. Unknown tags yield `None`, which the
    /// controller treats as "use the conservative fallback".
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "LoLp" => Some(Self::LoLp),
            "L2ARule" => Some(Self::L2A),
            "StallionRule" => Some(Self::Stallion),
            "Llama" => Some(Self::Llama),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::LoLp => "LoLp",
            Self::L2A => "L2ARule",
            Self::Stallion => "StallionRule",
            Self::Llama => "Llama",
        }
    }
}

/// Catch-up playback-rate controller configuration.
#[derive(Clone, Copy, Debug)]
pub struct CatchupOptions {
    /// Master switch for playback-rate control.
    pub enabled: bool,
    /// Latency above this means the session is not really live any more;
    /// no rate correction is attempted.
    pub latency_threshold: f64,
    /// Maximum rate deviation from 1.0 in either direction.
    pub playback_rate: f64,
    /// Latency drift below this does not trigger a correction.
    pub min_drift: f64,
    /// Buffer level below which the correction slows playback down.
    pub playback_buffer_min: f64,
    /// Rate deltas smaller than this are suppressed (0.25 on hosts that
    /// stutter on small rate writes, such as Safari-class browsers).
    pub min_rate_change: f64,
}

impl Default for CatchupOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            latency_threshold: 60.0,
            playback_rate: 0.3,
            min_drift: 0.05,
            playback_buffer_min: 0.5,
            min_rate_change: 0.02,
        }
    }
}

/// ABR engine configuration.
#[derive(Clone, Debug)]
pub struct AbrOptions {
    /// Active adaptation rule; `None` selects the conservative fallback.
    pub rule: Option<RuleKind>,
    /// Slow EWMA half-life for VoD, seconds.
    pub ewma_slow_vod: f64,
    /// Fast EWMA half-life for VoD, seconds.
    pub ewma_fast_vod: f64,
    /// Slow EWMA half-life for live, seconds.
    pub ewma_slow_live: f64,
    /// Fast EWMA half-life for live, seconds.
    pub ewma_fast_live: f64,
    /// Bandwidth estimate used before any sample arrives, bits per second.
    pub ewma_default_estimate: f64,
    /// Safety factor applied to the estimate for same-or-lower levels.
    pub bandwidth_factor: f64,
    /// Safety factor applied to the estimate for up-switches.
    pub bandwidth_up_factor: f64,
    /// Cap level selection with the measured (not nominal) bitrate once
    /// enough of a level has been buffered.
    pub max_with_real_bitrate: bool,
    /// Tolerated gap when locating the buffered range at the playhead.
    pub max_buffer_hole: f64,
    /// Extra fetch budget beyond the buffered horizon, seconds.
    pub max_starvation_delay: f64,
    /// Fetch budget for the very first load, seconds.
    pub max_loading_delay: f64,
    /// Lowest level auto-adaptation may pick.
    pub min_auto_level: usize,
    /// Highest level auto-adaptation may pick; `None` means the ladder top.
    pub max_auto_level: Option<usize>,
    /// Live-edge latency the session steers toward, seconds.
    pub target_latency: f64,
    /// Derive throughput samples from `moof`/`mdat` box timings instead of
    /// whole-response timings.
    pub box_throughput_sampling: bool,
    /// Seed for the pseudorandom draws of the LoL+ initialization.
    pub seed: u64,
    pub catchup: CatchupOptions,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            rule: None,
            ewma_slow_vod: 9.0,
            ewma_fast_vod: 3.0,
            ewma_slow_live: 9.0,
            ewma_fast_live: 3.0,
            ewma_default_estimate: 5e5,
            bandwidth_factor: 0.8,
            bandwidth_up_factor: 0.7,
            max_with_real_bitrate: false,
            max_buffer_hole: 0.1,
            max_starvation_delay: 4.0,
            max_loading_delay: 4.0,
            min_auto_level: 0,
            max_auto_level: None,
            target_latency: 1.5,
            box_throughput_sampling: false,
            seed: 0,
            catchup: CatchupOptions::default(),
        }
    }
}

impl AbrOptions {
    /// Set the adaptation rule.
    #[must_use]
    pub fn with_rule(mut self, rule: RuleKind) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Select the rule by configuration tag; unknown tags clear the rule,
    /// falling back to the conservative search.
    #[must_use]
    pub fn with_rule_tag(mut self, tag: &str) -> Self {
        self.rule = RuleKind::from_tag(tag);
        self
    }

    /// Set the RNG seed for reproducible LoL+ initialization.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the catch-up controller options.
    #[must_use]
    pub fn with_catchup(mut self, catchup: CatchupOptions) -> Self {
        self.catchup = catchup;
        self
    }

    /// Enable box-level throughput sampling.
    #[must_use]
    pub fn with_box_throughput_sampling(mut self, enabled: bool) -> Self {
        self.box_throughput_sampling = enabled;
        self
    }
}
