#![forbid(unsafe_code)]

use thiserror::Error;

/// Engine construction and configuration errors.
///
/// Decisions themselves are infallible: every runtime failure mode resolves
/// to a valid level index inside the engine.
#[derive(Debug, Error)]
pub enum AbrError {
    #[error("level ladder is empty")]
    EmptyLadder,

    #[error("level index {index} out of range for ladder of {len}")]
    InvalidLevel { index: usize, len: usize },
}

pub type AbrResult<T> = Result<T, AbrError>;
