//! Error types for value parsing.

use thiserror::Error;

/// Errors raised when parsing the text forms in this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    /// TTH text form has the wrong length
    #[error("bad TTH length: expected 39 base32 characters, got {0}")]
    TthLength(usize),

    /// TTH text form contains a character outside the base32 alphabet
    #[error("invalid base32 in TTH")]
    TthAlphabet,

    /// A serialized TTHL blob is not a whole number of 24-byte leaves
    #[error("TTHL blob length {0} is not a multiple of 24")]
    TthlLength(usize),

    /// Interval string is empty or malformed
    #[error("invalid interval: {0}")]
    Interval(String),
}
