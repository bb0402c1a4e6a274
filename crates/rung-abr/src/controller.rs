#![forbid(unsafe_code)]

use rung_events::{AbrEvent, EventBus, SwitchReason, TelemetryEvent};
use web_time::Instant;

use crate::{
    abandon::{self, AbandonGate, AbandonVerdict},
    catchup::CatchupController,
    error::{AbrError, AbrResult},
    estimator::{box_throughput_sample, BandwidthEstimator},
    options::{AbrOptions, RuleKind},
    rules::{AbrRule, L2ARule, LlamaRule, LoLpRule, RuleContext, StallionRule},
    types::{BufferInfo, Fragment, FragmentType, Level, LevelDetails, MediaClock, Part},
};

/// Lifecycle events the engine consumes from the player.
#[derive(Clone, Debug)]
pub enum PlaybackEvent {
    /// A level playlist finished loading.
    LevelLoaded { level: usize, details: LevelDetails },
    /// A fragment (or part) download started.
    FragLoading { frag: Fragment, part: Option<Part> },
    /// A fragment (or part) download finished.
    FragLoaded { frag: Fragment, part: Option<Part> },
    /// A fragment finished parsing.
    FragParsed { frag: Fragment },
    /// A fragment (or part) was appended to the media buffer.
    FragBuffered { frag: Fragment, part: Option<Part> },
    /// A playback error was reported.
    Error { kind: PlaybackErrorKind },
}

/// Error details relevant to adaptation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlaybackErrorKind {
    FragLoadError,
    FragLoadTimeout,
    BufferStalled,
}

/// The orchestrator: owns the active rule, the bandwidth estimator, the
/// abandonment gate and the catch-up controller, and turns player lifecycle
/// events plus media-clock observations into level decisions.
///
/// Single-threaded by design: every entry point takes `&mut self` and an
/// injected `now`, and decisions are computed synchronously.
pub struct AbrController<M: MediaClock> {
    options: AbrOptions,
    levels: Vec<Level>,
    media: M,
    bus: EventBus,
    estimator: BandwidthEstimator,
    catchup: CatchupController,
    rule: Option<Box<dyn AbrRule>>,
    active_rule: Option<RuleKind>,
    gate: AbandonGate,
    frag_current: Option<Fragment>,
    part_current: Option<Part>,
    last_loaded_frag_level: Option<usize>,
    last_sn: Option<u64>,
    /// Measured throughput of the last buffered fragment, kbit/s.
    last_throughput_kbps: f64,
    last_frag_duration: f64,
    /// Measured duration of the last bitrate-test probe, seconds.
    bitrate_test_delay_s: f64,
    /// Level forced by an emergency abandonment; `None` when not forced.
    forced_auto_level: Option<usize>,
    live: bool,
    destroyed: bool,
}

impl<M: MediaClock> AbrController<M> {
    pub fn new(
        levels: Vec<Level>,
        options: AbrOptions,
        media: M,
        bus: EventBus,
    ) -> AbrResult<Self> {
        if levels.is_empty() {
            return Err(AbrError::EmptyLadder);
        }
        if options.min_auto_level >= levels.len() {
            return Err(AbrError::InvalidLevel {
                index: options.min_auto_level,
                len: levels.len(),
            });
        }
        if let Some(max) = options.max_auto_level {
            if max >= levels.len() {
                return Err(AbrError::InvalidLevel {
                    index: max,
                    len: levels.len(),
                });
            }
        }

        let estimator = BandwidthEstimator::new(
            options.ewma_slow_vod,
            options.ewma_fast_vod,
            options.ewma_default_estimate,
        );
        let catchup = CatchupController::new(options.catchup);
        Ok(Self {
            options,
            levels,
            media,
            bus,
            estimator,
            catchup,
            rule: None,
            active_rule: None,
            gate: AbandonGate::default(),
            frag_current: None,
            part_current: None,
            last_loaded_frag_level: None,
            last_sn: None,
            last_throughput_kbps: 0.0,
            last_frag_duration: 0.0,
            bitrate_test_delay_s: 0.0,
            forced_auto_level: None,
            live: false,
            destroyed: false,
        })
    }

    /// Change the active rule tag. The new rule is instantiated lazily on
    /// the next decision; the old one is dropped then.
    pub fn set_rule(&mut self, rule: Option<RuleKind>) {
        self.options.rule = rule;
    }

    /// Level forced by an emergency abandonment, if one is pending.
    #[must_use]
    pub fn next_load_level(&self) -> Option<usize> {
        self.forced_auto_level
    }

    #[must_use]
    pub fn bandwidth_estimate_bps(&self) -> f64 {
        self.estimator.estimate_bps()
    }

    /// Unregister from the world: cancel the abandonment gate, drop the
    /// rule, and ignore every subsequent event.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.gate.disarm();
        self.rule = None;
        self.frag_current = None;
        self.part_current = None;
    }

    /// Feed one player lifecycle event.
    pub fn handle_event(&mut self, event: PlaybackEvent, now: Instant) {
        if self.destroyed {
            return;
        }
        match event {
            PlaybackEvent::LevelLoaded { level, details } => self.on_level_loaded(level, details),
            PlaybackEvent::FragLoading { frag, part } => self.on_frag_loading(frag, part, now),
            PlaybackEvent::FragLoaded { frag, part } => self.on_frag_loaded(frag, part),
            PlaybackEvent::FragParsed { frag } => {
                if let Some(rule) = self.rule.as_mut() {
                    rule.on_fragment_parsed(&frag);
                }
            }
            PlaybackEvent::FragBuffered { frag, part } => self.on_frag_buffered(&frag, part.as_ref()),
            PlaybackEvent::Error { kind } => self.on_error(kind),
        }
    }

    fn on_level_loaded(&mut self, level: usize, details: LevelDetails) {
        if let Some(entry) = self.levels.get_mut(level) {
            entry.details = Some(details);
        }
        self.live = details.live;
        if details.live {
            self.estimator
                .update_half_lives(self.options.ewma_slow_live, self.options.ewma_fast_live);
        } else {
            self.estimator
                .update_half_lives(self.options.ewma_slow_vod, self.options.ewma_fast_vod);
        }
    }

    fn on_frag_loading(&mut self, frag: Fragment, part: Option<Part>, now: Instant) {
        if frag.frag_type == FragmentType::Main && frag.sn.media().is_some() {
            self.gate.arm(now);
        }
        self.frag_current = Some(frag);
        self.part_current = part;
    }

    fn on_frag_loaded(&mut self, frag: Fragment, part: Option<Part>) {
        self.gate.disarm();
        self.frag_current = None;
        self.part_current = None;

        if frag.frag_type != FragmentType::Main {
            return;
        }
        let Some(sn) = frag.sn.media() else {
            return;
        };
        self.last_loaded_frag_level = Some(frag.level);
        self.last_sn = Some(sn);

        if let Some(forced) = self.forced_auto_level {
            if frag.level <= forced {
                // The forced retry landed; stop capping.
                self.forced_auto_level = None;
            }
        }

        if self.options.max_with_real_bitrate {
            let stats = part.as_ref().map_or(&frag.stats, |p| &p.stats);
            let duration = part.as_ref().map_or(frag.duration, |p| p.duration);
            if let Some(level) = self.levels.get_mut(frag.level) {
                level.loaded_bytes += stats.loaded;
                level.loaded_duration += duration;
            }
        }

        if frag.bitrate_test {
            // Probe fragments never reach the buffer; account for them now.
            let mut probe = frag;
            probe.stats.parsing_end = probe.stats.loading_end;
            self.on_frag_buffered(&probe, part.as_ref());
        }
    }

    fn on_frag_buffered(&mut self, frag: &Fragment, part: Option<&Part>) {
        let stats = part.map_or(&frag.stats, |p| &p.stats);
        if stats.aborted {
            return;
        }
        if frag.frag_type != FragmentType::Main || frag.sn.media().is_none() {
            return;
        }

        let sample = if self.options.box_throughput_sampling {
            box_throughput_sample(stats).or_else(|| Self::processing_sample(stats))
        } else {
            Self::processing_sample(stats)
        };
        let Some((duration, bytes)) = sample else {
            return;
        };

        self.estimator.sample(duration, bytes);
        let duration_s = duration.as_secs_f64();
        if duration_s > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.last_throughput_kbps = bytes as f64 * 8.0 / duration_s / 1000.0;
            }
        }
        self.last_frag_duration = part.map_or(frag.duration, |p| p.duration);
        self.bitrate_test_delay_s = if frag.bitrate_test { duration_s } else { 0.0 };

        self.bus.publish(TelemetryEvent::ThroughputSampled {
            bits_per_second: self.estimator.estimate_bps(),
        });
    }

    fn processing_sample(
        stats: &crate::types::LoaderStats,
    ) -> Option<(std::time::Duration, u64)> {
        let end = stats.parsing_end.or(stats.loading_end)?;
        let duration = end.saturating_duration_since(stats.loading_start);
        if duration.is_zero() {
            return None;
        }
        Some((duration, stats.loaded))
    }

    fn on_error(&mut self, kind: PlaybackErrorKind) {
        match kind {
            PlaybackErrorKind::FragLoadError | PlaybackErrorKind::FragLoadTimeout => {
                self.gate.disarm();
                self.frag_current = None;
                self.part_current = None;
            }
            PlaybackErrorKind::BufferStalled => {
                if let Some(rule) = self.rule.as_mut() {
                    rule.on_stall();
                }
            }
        }
    }

    /// Periodic entry point for the emergency-abandonment check. The host
    /// calls this at its own cadence; the internal gate enforces the check
    /// interval while a main fragment is loading.
    pub fn tick(&mut self, now: Instant) -> Option<AbandonVerdict> {
        if self.destroyed || !self.gate.due(now) {
            return None;
        }
        let frag = self.frag_current.as_ref()?;
        if frag.frag_type != FragmentType::Main {
            return None;
        }

        let buffer = self.buffer_info();
        let verdict = abandon::check(
            frag,
            self.part_current.as_ref(),
            &self.levels,
            self.options.min_auto_level,
            self.media.playback_rate(),
            buffer.end,
            self.media.position_secs(),
            now,
        )?;

        self.estimator
            .sample(verdict.request_delay, verdict.loaded_bytes);
        self.forced_auto_level = Some(verdict.next_load_level);
        self.gate.disarm();

        let mut level = 0;
        let mut sn = 0;
        if let Some(frag) = self.frag_current.as_mut() {
            frag.stats.aborted = true;
            level = frag.level;
            sn = frag.sn.media().unwrap_or(0);
        }
        let part = self.part_current.as_mut().map(|part| {
            part.stats.aborted = true;
            part.index
        });

        self.bus.publish(AbrEvent::EmergencyAborted {
            level,
            sn,
            part,
            loaded_bytes: verdict.loaded_bytes,
            next_load_level: verdict.next_load_level,
        });
        Some(verdict)
    }

    /// The decision entry point: the next level to load from.
    pub fn next_auto_level(&mut self, now: Instant) -> usize {
        let current = self.current_level();
        if self.destroyed {
            return current;
        }
        self.ensure_rule();

        let buffer = self.buffer_info();
        let latency = self.media.live_latency();
        let playback_rate = self.media.playback_rate();
        let playing = !self.media.is_paused();

        let (mut level, mut reason) = if let Some(rule) = self.rule.as_mut() {
            let ctx = RuleContext {
                levels: &self.levels,
                current_level: current,
                throughput_kbps: self.last_throughput_kbps,
                latency,
                target_latency: self.options.target_latency,
                buffer_len: buffer.len,
                playback_rate: if playback_rate == 0.0 {
                    1.0
                } else {
                    playback_rate.abs()
                },
                frag_duration: self.last_frag_duration,
                live: self.live,
                frag_type: FragmentType::Main,
                frag_sn: self.last_sn,
            };
            let quality = rule.next_quality(&ctx);
            if let Some(total_qoe) = rule.last_qoe() {
                self.bus.publish(TelemetryEvent::QoeComputed { total_qoe });
            }
            (quality, SwitchReason::Rule(rule.kind().tag()))
        } else {
            (self.find_best_level(&buffer), SwitchReason::Fallback)
        };

        level = level.clamp(self.options.min_auto_level, self.max_auto_level());
        level = self.enforce_codec_partition(level, current);

        if let Some(forced) = self.forced_auto_level {
            // An abandonment outranks the rule until its retry lands, but a
            // reliable estimator may still pick something lower.
            if !self.estimator.can_estimate() || forced < level {
                level = forced;
                reason = SwitchReason::ForcedCap;
            }
            // The abandonment walk is codec-blind; the partition still binds.
            level = self.enforce_codec_partition(level, current);
        }

        if let Some(latency) = latency {
            if let Some(rate) = self.catchup.playback_rate(
                latency,
                self.options.target_latency,
                buffer.len,
                playback_rate,
                playing,
            ) {
                self.media.set_playback_rate(rate);
                self.bus
                    .publish(TelemetryEvent::PlaybackRateChanged { rate });
            }
        }

        if level != current {
            tracing::debug!(from = current, to = level, ?reason, "level decision");
            self.bus.publish(AbrEvent::LevelSwitched {
                from: current,
                to: level,
                reason,
            });
        }
        level
    }

    fn ensure_rule(&mut self) {
        if self.active_rule != self.options.rule {
            if let Some(old) = self.rule.take() {
                tracing::debug!(old = old.kind().tag(), "tearing down rule");
            }
            self.active_rule = self.options.rule;
        }
        if self.rule.is_none() {
            if let Some(kind) = self.active_rule {
                tracing::debug!(rule = kind.tag(), "instantiating rule");
                self.rule = Some(match kind {
                    RuleKind::LoLp => Box::new(LoLpRule::new(self.options.seed)),
                    RuleKind::L2A => Box::new(L2ARule::new()),
                    RuleKind::Stallion => Box::new(StallionRule::new()),
                    RuleKind::Llama => Box::new(LlamaRule::new()),
                });
            }
        }
    }

    fn current_level(&self) -> usize {
        self.last_loaded_frag_level
            .unwrap_or(self.options.min_auto_level)
            .min(self.levels.len() - 1)
    }

    fn max_auto_level(&self) -> usize {
        self.options
            .max_auto_level
            .unwrap_or(self.levels.len() - 1)
            .min(self.levels.len() - 1)
    }

    fn buffer_info(&self) -> BufferInfo {
        BufferInfo::from_ranges(
            self.media.position_secs(),
            &self.media.buffered_ranges(),
            self.options.max_buffer_hole,
        )
    }

    /// Keep switches inside the codec family of what is already playing.
    fn enforce_codec_partition(&self, level: usize, current: usize) -> usize {
        let Some(last) = self.last_loaded_frag_level else {
            return level;
        };
        let Some(last_level) = self.levels.get(last) else {
            return level;
        };
        if self.levels[level].codec_set == last_level.codec_set {
            level
        } else {
            current
        }
    }

    /// Conservative level search used when no rule is active: the highest
    /// level whose adjusted bandwidth need and fetch budget both fit.
    fn find_best_level(&self, buffer: &BufferInfo) -> usize {
        let playback_rate = {
            let rate = self.media.playback_rate().abs();
            if rate > 0.0 {
                rate
            } else {
                1.0
            }
        };
        let avg_bw = self.estimator.estimate_bps();
        let starvation_delay = buffer.len / playback_rate;

        let mut max_starvation = self.options.max_starvation_delay;
        let mut bw_factor = self.options.bandwidth_factor;
        let mut bw_up_factor = self.options.bandwidth_up_factor;
        if buffer.len <= 0.0 && self.bitrate_test_delay_s > 0.0 {
            // A completed probe widens the first-load budget and makes the
            // estimate trustworthy as-is.
            max_starvation = (self.options.max_loading_delay - self.bitrate_test_delay_s).max(0.0);
            bw_factor = 1.0;
            bw_up_factor = 1.0;
        }
        let budget = starvation_delay + max_starvation;

        let current = self.current_level();
        let last_codec = self
            .last_loaded_frag_level
            .and_then(|i| self.levels.get(i))
            .map(|l| l.codec_set.clone());

        for i in (self.options.min_auto_level..=self.max_auto_level()).rev() {
            let level = &self.levels[i];
            if let Some(codec) = &last_codec {
                if &level.codec_set != codec {
                    continue;
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let mut bitrate = level.max_bitrate as f64;
            if self.options.max_with_real_bitrate {
                let real = level.real_bitrate();
                if real > 0.0 {
                    bitrate = bitrate.max(real);
                }
            }

            let factor = if i <= current { bw_factor } else { bw_up_factor };
            let adjusted_bw = factor * avg_bw;
            let avg_duration = self.average_duration(level);
            let fetch_secs = if adjusted_bw > 0.0 {
                bitrate * avg_duration / adjusted_bw
            } else {
                f64::INFINITY
            };

            let fits_budget =
                self.live || fetch_secs <= 0.0 || !fetch_secs.is_finite() || fetch_secs < budget;
            if adjusted_bw > bitrate && fits_budget {
                tracing::debug!(
                    level = i,
                    adjusted_bw,
                    bitrate,
                    fetch_secs,
                    budget,
                    "fallback selection"
                );
                return i;
            }
        }
        self.options.min_auto_level
    }

    fn average_duration(&self, level: &Level) -> f64 {
        level
            .details
            .map(|d| d.average_target_duration)
            .filter(|d| *d > 0.0)
            .unwrap_or(self.last_frag_duration)
    }
}
