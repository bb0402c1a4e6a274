#![forbid(unsafe_code)]

/// Why the engine picked (or was forced into) a level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchReason {
    /// Decided by the active adaptation rule; carries the rule tag.
    Rule(&'static str),
    /// Decided by the conservative fallback search (no rule active).
    Fallback,
    /// Capped by a forced next-load level left behind by an abandonment.
    ForcedCap,
    /// An in-flight fragment was abandoned mid-download.
    EmergencyAbandon,
}

/// Decision events emitted by the ABR engine.
#[derive(Clone, Debug)]
pub enum AbrEvent {
    /// The next-load level changed.
    LevelSwitched {
        from: usize,
        to: usize,
        reason: SwitchReason,
    },
    /// An in-flight fragment will not finish before starvation and was
    /// aborted in favor of a lower rendition.
    EmergencyAborted {
        /// Level the abandoned fragment was loading from.
        level: usize,
        /// Sequence number of the abandoned fragment.
        sn: u64,
        /// Part index, for LL-HLS part loads.
        part: Option<usize>,
        /// Bytes received before the abort.
        loaded_bytes: u64,
        /// Level forced for the retry.
        next_load_level: usize,
    },
}
