//! Error types for file-list handling.

use thiserror::Error;

/// Errors raised by tree mutation and list I/O.
#[derive(Debug, Error)]
pub enum ListError {
    /// Node name is empty, contains `/`, or is `.` / `..`
    #[error("invalid node name: {0:?}")]
    InvalidName(String),

    /// A sibling with the same case-insensitive name already exists
    #[error("duplicate name under parent: {0:?}")]
    Duplicate(String),

    /// Operation expected a directory node
    #[error("not a directory")]
    NotADirectory,

    /// Operation expected a detached node
    #[error("node is already attached to a parent")]
    AlreadyAttached,

    /// The root cannot be removed or re-attached
    #[error("operation not valid on the root node")]
    IsRoot,

    /// Stale or foreign node id
    #[error("unknown node id")]
    UnknownNode,

    /// Listing XML is structurally invalid
    #[error("malformed file list: {0}")]
    Malformed(String),

    /// Underlying XML parse failure
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// File or decompression I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker task was cancelled before completing
    #[error("list load task cancelled")]
    Cancelled,
}
