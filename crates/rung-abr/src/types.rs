#![forbid(unsafe_code)]

#[cfg(test)]
use mockall::automock;
use web_time::Instant;

/// One rendition of the encoding ladder. Index 0 is lowest.
#[derive(Clone, Debug)]
pub struct Level {
    /// Nominal bitrate in bits per second.
    pub bitrate: u64,
    /// Peak bitrate in bits per second (falls back to `bitrate` when the
    /// manifest does not carry a separate peak).
    pub max_bitrate: u64,
    /// Codec family identifier. Switches only happen within one codec set.
    pub codec_set: String,
    /// Playlist-level details, present once the level playlist is loaded.
    pub details: Option<LevelDetails>,
    /// Bytes of this level buffered so far (for the measured bitrate).
    pub loaded_bytes: u64,
    /// Media seconds of this level buffered so far.
    pub loaded_duration: f64,
}

impl Level {
    /// Create a level with equal nominal and peak bitrate.
    #[must_use]
    pub fn new(bitrate: u64, codec_set: &str) -> Self {
        Self {
            bitrate,
            max_bitrate: bitrate,
            codec_set: codec_set.to_owned(),
            details: None,
            loaded_bytes: 0,
            loaded_duration: 0.0,
        }
    }

    /// Measured bitrate from the `(loaded_bytes, loaded_duration)` accumulator,
    /// in bits per second. Zero until something has been buffered.
    #[must_use]
    pub fn real_bitrate(&self) -> f64 {
        if self.loaded_duration > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.loaded_bytes as f64 * 8.0 / self.loaded_duration
            }
        } else {
            0.0
        }
    }
}

/// Per-playlist details relevant to adaptation.
#[derive(Clone, Copy, Debug)]
pub struct LevelDetails {
    pub live: bool,
    /// Average segment target duration in seconds.
    pub average_target_duration: f64,
    /// LL-HLS part target duration, when the playlist advertises parts.
    pub part_target: Option<f64>,
}

/// Ladder-wide helpers over a slice of levels.
pub trait Ladder {
    /// Lowest nominal bitrate in kbit/s.
    fn min_bitrate_kbps(&self) -> f64;
    /// Highest nominal bitrate in kbit/s.
    fn max_bitrate_kbps(&self) -> f64;
}

impl Ladder for [Level] {
    #[allow(clippy::cast_precision_loss)]
    fn min_bitrate_kbps(&self) -> f64 {
        self.iter()
            .map(|l| l.bitrate)
            .min()
            .map_or(0.0, |b| b as f64 / 1000.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn max_bitrate_kbps(&self) -> f64 {
        self.iter()
            .map(|l| l.bitrate)
            .max()
            .map_or(0.0, |b| b as f64 / 1000.0)
    }
}

/// Sequence identifier of a fragment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sn {
    /// Initialization segment; never sampled for throughput.
    Init,
    /// Media sequence number.
    Media(u64),
}

impl Sn {
    #[must_use]
    pub fn media(self) -> Option<u64> {
        match self {
            Self::Init => None,
            Self::Media(sn) => Some(sn),
        }
    }
}

/// Playlist type a fragment belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FragmentType {
    Main,
    Audio,
    Subtitle,
}

/// `(timestamp, length)` record for one container box boundary observed on
/// the wire. Chunks are tagged by whether they begin a `moof` or an `mdat`.
#[derive(Clone, Copy, Debug)]
pub struct ChunkTiming {
    pub at: Instant,
    pub len: u64,
}

/// Loader statistics for a fragment or part download.
#[derive(Clone, Debug)]
pub struct LoaderStats {
    pub loading_start: Instant,
    pub loading_end: Option<Instant>,
    pub parsing_end: Option<Instant>,
    /// Bytes received so far.
    pub loaded: u64,
    /// Total expected bytes, when the response advertised a length.
    pub total: Option<u64>,
    /// Bandwidth estimate attached by the loader, bits per second.
    pub bw_estimate: Option<f64>,
    pub aborted: bool,
    /// `moof` boundaries observed during the download.
    pub start_time_data: Vec<ChunkTiming>,
    /// `mdat` boundaries observed during the download.
    pub end_time_data: Vec<ChunkTiming>,
    /// Sum of `mdat` lengths.
    pub box_loaded: u64,
}

impl LoaderStats {
    #[must_use]
    pub fn new(loading_start: Instant) -> Self {
        Self {
            loading_start,
            loading_end: None,
            parsing_end: None,
            loaded: 0,
            total: None,
            bw_estimate: None,
            aborted: false,
            start_time_data: Vec::new(),
            end_time_data: Vec::new(),
            box_loaded: 0,
        }
    }

    /// Wall time spent loading, if the download finished.
    #[must_use]
    pub fn loading_time_secs(&self) -> Option<f64> {
        self.loading_end
            .map(|end| end.saturating_duration_since(self.loading_start).as_secs_f64())
    }
}

/// A media fragment (segment) as reported by the loader.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub sn: Sn,
    /// Ladder index this fragment was loaded from.
    pub level: usize,
    pub frag_type: FragmentType,
    /// Media duration in seconds.
    pub duration: f64,
    /// Start position on the media timeline, seconds.
    pub start: f64,
    /// Probe fragment used to seed the bandwidth estimate before playback.
    pub bitrate_test: bool,
    pub stats: LoaderStats,
}

/// An LL-HLS part: a sub-fragment with its own stats.
#[derive(Clone, Debug)]
pub struct Part {
    pub index: usize,
    pub duration: f64,
    pub stats: LoaderStats,
}

/// Forward buffer measured from the playhead.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferInfo {
    /// Seconds of contiguous media ahead of the playhead.
    pub len: f64,
    /// End of the contiguous range, media-timeline seconds.
    pub end: f64,
}

impl BufferInfo {
    /// Locate the buffered range covering `position` and measure the forward
    /// buffer. Ranges whose start is within `max_hole` behind the playhead
    /// still count, so sub-`max_hole` gaps do not read as starvation.
    #[must_use]
    pub fn from_ranges(position: f64, ranges: &[(f64, f64)], max_hole: f64) -> Self {
        for &(start, end) in ranges {
            if position + max_hole >= start && position < end {
                return Self {
                    len: end - position,
                    end,
                };
            }
        }
        Self {
            len: 0.0,
            end: position,
        }
    }
}

/// Read-only view of the media element the engine observes, plus the single
/// mutation it is allowed: the playback rate.
#[cfg_attr(test, automock)]
pub trait MediaClock {
    /// Current playhead position, media-timeline seconds.
    fn position_secs(&self) -> f64;

    /// Current playback rate (1.0 is normal speed).
    fn playback_rate(&self) -> f64;

    /// Write a new playback rate (catch-up controller output).
    fn set_playback_rate(&self, rate: f64);

    /// Buffered time ranges as `(start, end)` pairs in seconds.
    fn buffered_ranges(&self) -> Vec<(f64, f64)>;

    fn is_paused(&self) -> bool;

    /// Distance behind the live edge, seconds. `None` for VoD.
    fn live_latency(&self) -> Option<f64>;
}
