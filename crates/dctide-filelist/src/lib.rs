//! # dctide-filelist
//!
//! The in-memory model of a file listing: our own share or a peer's
//! browsed share. A listing is a tree of named nodes with canonical
//! case-insensitive ordering, aggregate directory sizes, recursive
//! search, and an XML external form (optionally bzip2-compressed) as
//! exchanged between Direct Connect clients.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod load;
pub mod search;
pub mod tree;
pub mod xml;

pub use error::ListError;
pub use search::{SearchOpts, SizePred, TypeMask};
pub use tree::{FileTree, LocalMeta, Node, NodeId, NodeKind};
