#![forbid(unsafe_code)]

use std::time::Duration;

use web_time::Instant;

use crate::types::{Fragment, Level, Part};

/// Spacing between abandonment checks while a fragment is loading.
pub(crate) const CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Fraction of the fragment duration that must elapse before a download is
/// judged at all, milliseconds per second of media.
const MIN_REQUEST_DELAY_MS_PER_S: f64 = 500.0;
/// Safety factor on the load rate when projecting lower-level fetches.
const NEXT_LEVEL_RATE_FACTOR: f64 = 0.8;

/// Idempotently cancellable gate enforcing the periodic check cadence.
///
/// The host event loop calls [`AbrController::tick`] at its own pace; this
/// gate turns that into at-most-one check per interval while armed.
///
/// [`AbrController::tick`]: crate::AbrController::tick
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AbandonGate {
    next_due: Option<Instant>,
}

impl AbandonGate {
    pub(crate) fn arm(&mut self, now: Instant) {
        self.next_due = Some(now);
    }

    pub(crate) fn disarm(&mut self) {
        self.next_due = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.next_due.is_some()
    }

    /// True at most once per interval while armed.
    pub(crate) fn due(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + CHECK_INTERVAL);
                true
            }
            _ => false,
        }
    }
}

/// Outcome of an abandonment check that decided to abort.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AbandonVerdict {
    /// Level to force for the retry.
    pub next_load_level: usize,
    /// Time the request had been running, for the estimator sample.
    pub request_delay: Duration,
    /// Bytes received before the abort.
    pub loaded_bytes: u64,
}

/// Decide whether the in-flight fragment should be abandoned.
///
/// The projection compares how long the rest of this download will take
/// against how long playback can survive on the current buffer; when a
/// lower rendition could land inside that window, the download is not worth
/// finishing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn check(
    frag: &Fragment,
    part: Option<&Part>,
    levels: &[Level],
    min_auto_level: usize,
    playback_rate: f64,
    buffer_end: f64,
    position: f64,
    now: Instant,
) -> Option<AbandonVerdict> {
    let (stats, duration) = match part {
        Some(part) => (&part.stats, part.duration),
        None => (&frag.stats, frag.duration),
    };
    if stats.aborted || stats.loading_end.is_some() || duration <= 0.0 {
        return None;
    }
    let level = levels.get(frag.level)?;

    let playback_rate = playback_rate.abs();
    let request_delay_ms = now
        .saturating_duration_since(stats.loading_start)
        .as_secs_f64()
        * 1000.0;
    // Too early to judge: the response may simply not have ramped up yet.
    if request_delay_ms <= MIN_REQUEST_DELAY_MS_PER_S * duration / playback_rate {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let loaded = stats.loaded as f64;
    #[allow(clippy::cast_precision_loss)]
    let expected_len = stats.total.map_or_else(
        || {
            let nominal = (duration * level.max_bitrate as f64 / 8.0).ceil();
            loaded.max(nominal)
        },
        |total| total as f64,
    );

    let load_rate = stats
        .bw_estimate
        .filter(|bw| *bw > 0.0)
        .map_or(loaded * 1000.0 / request_delay_ms, |bw| bw / 8.0)
        .max(1.0);

    let frag_loaded_delay = (expected_len - loaded) / load_rate;
    let buffer_starvation_delay = (buffer_end - position).max(0.0) / playback_rate;

    // Enough runway, or the download will beat starvation anyway.
    if buffer_starvation_delay >= 2.0 * duration / playback_rate
        || frag_loaded_delay <= buffer_starvation_delay
    {
        return None;
    }

    // Walk the ladder down looking for a level whose fetch fits the runway.
    let mut next_load_level = frag.level;
    let mut next_load_delay = f64::INFINITY;
    for candidate in (min_auto_level..frag.level).rev() {
        #[allow(clippy::cast_precision_loss)]
        let candidate_bitrate = levels[candidate].max_bitrate as f64;
        next_load_delay =
            duration * candidate_bitrate / (8.0 * NEXT_LEVEL_RATE_FACTOR * load_rate);
        next_load_level = candidate;
        if next_load_delay < buffer_starvation_delay {
            break;
        }
    }

    if next_load_delay >= frag_loaded_delay {
        return None;
    }

    tracing::warn!(
        level = frag.level,
        next_load_level,
        frag_loaded_delay,
        buffer_starvation_delay,
        "emergency abandoning fragment"
    );
    Some(AbandonVerdict {
        next_load_level,
        request_delay: Duration::from_secs_f64(request_delay_ms / 1000.0),
        loaded_bytes: stats.loaded,
    })
}
