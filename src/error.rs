//! Error types for frame dissection

use thiserror::Error;

/// Errors raised while dissecting a single frame
///
/// Only structural problems are errors. Digest mismatches, bogus fragments and
/// correlation misses are reported as annotations instead.
#[derive(Debug, Error)]
pub enum DissectError {
    #[error("Frame too short: need {needed} bytes at offset {offset}, have {available}")]
    Bounds {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for dissection operations
pub type DissectResult<T> = Result<T, DissectError>;
