//! # dctide-hash
//!
//! Supporting value types for the dctide engine:
//! - **Tiger tree hashing (THEX)**: streaming leaf/block contexts, root
//!   recombination over serialized leaf sequences
//! - **TTH text form**: 39-character base32 encoding used in file lists,
//!   search results and the incoming-spool naming scheme
//! - **Interval parsing**: `"600"` / `"10m"` / `"1h30m"` duration strings
//! - **Rate accounting**: sliding-window byte counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod interval;
pub mod rate;
pub mod tth;

pub use error::HashError;
pub use interval::parse_interval;
pub use rate::RateCalc;
pub use tth::{Tth, TthContext, block_size, leaves_from_blob, leaves_to_blob, tth_root};

/// Size of a Tiger digest and of every TTHL leaf, in bytes.
pub const TTH_BYTES: usize = 24;

/// Length of the base32 text form of a TTH (24 bytes, unpadded).
pub const TTH_BASE32_LEN: usize = 39;

/// THEX segment size: leaves hash the file in runs of this many bytes.
pub const TTH_SEGMENT: usize = 1024;
