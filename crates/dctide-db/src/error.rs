//! Error types for the persistence service.

use thiserror::Error;

/// Errors surfaced by the persistence service.
///
/// Cloneable so a single failure can be fanned out to every request in
/// a chained batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The store could not be opened or initialized
    #[error("cannot open database: {0}")]
    Open(String),

    /// Store written by an older, incompatible schema
    #[error("database schema version {found} is too old (need {need}); run the upgrade tool")]
    SchemaTooOld {
        /// Version found in the store
        found: i32,
        /// Version this build needs
        need: i32,
    },

    /// Store written by a newer client
    #[error("database schema version {found} is newer than this client supports ({need}); upgrade the client")]
    SchemaTooNew {
        /// Version found in the store
        found: i32,
        /// Version this build needs
        need: i32,
    },

    /// A query failed; the enclosing transaction was rolled back
    #[error("query failed: {0}")]
    Query(String),

    /// Request was skipped because an earlier query in its chain failed
    #[error("chained request aborted by earlier failure")]
    ChainAborted,

    /// The service thread is gone
    #[error("persistence service stopped")]
    ServiceStopped,
}
