//! Error types for the engine core.

use thiserror::Error;

/// Errors raised by the engine core.
///
/// The `Fatal` variants are startup-only: the caller prints the message
/// and exits. Everything else stays inside the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Data directory missing or not writable
    #[error("cannot use data directory {path}: {reason}")]
    DataDir {
        /// The offending path
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Another process owns the data directory
    #[error("data directory is locked by another process")]
    Locked,

    /// Persistence failure bubbled up from the service
    #[error(transparent)]
    Db(#[from] dctide_db::DbError),

    /// A configuration value was rejected
    #[error("invalid value for {name}: {reason}")]
    BadConfig {
        /// Option name
        name: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Unknown configuration option
    #[error("unknown configuration option {0:?}")]
    UnknownOption(String),

    /// File-list failure bubbled up from the list layer
    #[error(transparent)]
    List(#[from] dctide_filelist::ListError),

    /// Value-type parse failure
    #[error(transparent)]
    Hash(#[from] dctide_hash::HashError),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
