//! Multi-algorithm ABR decision engine for chunked HLS playback.
//!
//! The engine selects, at every segment (or part) boundary, the next
//! rendition to load from an encoding ladder, and in live catch-up mode the
//! instantaneous playback rate. Four interchangeable rules share one input
//! contract:
//!
//! - **LoL+** — a self-organizing-map classifier with dynamic weight
//!   selection and a per-segment QoE evaluator
//! - **L2A-LL** — online learning driven by a Lagrangian multiplier and
//!   projection onto the probability simplex
//! - **Stallion** — mean-minus-k-sigma throughput with a latency safety band
//! - **Llama** — a harmonic-mean throughput heuristic with hysteresis
//!
//! [`AbrController`] owns the active rule, an EWMA bandwidth estimator, an
//! emergency download-abandonment check and the catch-up playback-rate
//! controller. It consumes pre-parsed fragment statistics — it performs no
//! I/O, owns no sockets, and observes (never owns) the media clock.
//!
//! ## Example
//!
//! ```rust
//! use rung_abr::{AbrController, AbrOptions, Level, MediaClock, RuleKind};
//! use rung_events::EventBus;
//! use web_time::Instant;
//!
//! struct StubClock;
//!
//! impl MediaClock for StubClock {
//!     fn position_secs(&self) -> f64 {
//!         0.0
//!     }
//!     fn playback_rate(&self) -> f64 {
//!         1.0
//!     }
//!     fn set_playback_rate(&self, _rate: f64) {}
//!     fn buffered_ranges(&self) -> Vec<(f64, f64)> {
//!         vec![(0.0, 8.0)]
//!     }
//!     fn is_paused(&self) -> bool {
//!         false
//!     }
//!     fn live_latency(&self) -> Option<f64> {
//!         None
//!     }
//! }
//!
//! let ladder = vec![
//!     Level::new(300_000, "avc1"),
//!     Level::new(1_500_000, "avc1"),
//! ];
//! let options = AbrOptions::default().with_rule(RuleKind::Llama);
//! let mut controller =
//!     AbrController::new(ladder, options, StubClock, EventBus::new(16)).unwrap();
//!
//! let level = controller.next_auto_level(Instant::now());
//! assert!(level < 2);
//! ```

#![forbid(unsafe_code)]

mod abandon;
mod catchup;
mod controller;
mod error;
mod estimator;
mod options;
mod qoe;
mod rules;
mod types;

pub use abandon::AbandonVerdict;
pub use catchup::CatchupController;
pub use controller::{AbrController, PlaybackErrorKind, PlaybackEvent};
pub use error::{AbrError, AbrResult};
pub use estimator::{box_throughput_sample, BandwidthEstimator, Ewma};
pub use options::{AbrOptions, CatchupOptions, RuleKind};
pub use qoe::{LatencyPenaltyTier, QoeEvaluator, QoeInfo};
pub use rules::{
    AbrRule, L2ARule, LlamaRule, LoLpRule, RuleContext, StallionRule, WeightSelectionMode,
    WeightSelector,
};
pub use types::{
    BufferInfo, ChunkTiming, Fragment, FragmentType, Ladder, Level, LevelDetails, LoaderStats,
    MediaClock, Part, Sn,
};
