//! Download records.

use std::collections::BTreeSet;
use std::path::PathBuf;

use dctide_hash::{tth::TthContext, Tth, TTH_BYTES};

use crate::user::Uid;

/// Scheduling priority of a download. `Error` and `Off` are disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Disabled by a sticky error
    Error,
    /// Disabled by the user
    Off,
    /// Lowest enabled priority
    VeryLow,
    /// Below normal
    Low,
    /// Normal
    #[default]
    Med,
    /// Above normal
    High,
    /// Highest
    VeryHigh,
}

impl Priority {
    /// True when the scheduler may pick this download.
    #[must_use]
    pub fn enabled(self) -> bool {
        self >= Priority::VeryLow
    }

    /// Stable integer form for persistence.
    #[must_use]
    pub fn to_db(self) -> i64 {
        match self {
            Priority::Error => -2,
            Priority::Off => -1,
            Priority::VeryLow => 0,
            Priority::Low => 1,
            Priority::Med => 2,
            Priority::High => 3,
            Priority::VeryHigh => 4,
        }
    }

    /// Inverse of [`Priority::to_db`]; out-of-range values clamp to
    /// `Med`.
    #[must_use]
    pub fn from_db(v: i64) -> Priority {
        match v {
            -2 => Priority::Error,
            -1 => Priority::Off,
            0 => Priority::VeryLow,
            1 => Priority::Low,
            3 => Priority::High,
            4 => Priority::VeryHigh,
            _ => Priority::Med,
        }
    }
}

/// Download error kinds, global or per-user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DlErrorKind {
    /// No error
    #[default]
    None,
    /// Received TTHL did not hash to the file root
    BadTthl,
    /// Peer reported the file unavailable
    NotAvailable,
    /// I/O failure on the incoming file
    IoIncoming,
    /// I/O failure moving to the destination
    IoDestination,
    /// A received block failed verification
    HashMismatch,
}

impl DlErrorKind {
    /// Stable integer form for persistence.
    #[must_use]
    pub fn to_db(self) -> i64 {
        match self {
            DlErrorKind::None => 0,
            DlErrorKind::BadTthl => 1,
            DlErrorKind::NotAvailable => 2,
            DlErrorKind::IoIncoming => 3,
            DlErrorKind::IoDestination => 4,
            DlErrorKind::HashMismatch => 5,
        }
    }

    /// Inverse of [`DlErrorKind::to_db`]; unknown values clamp to
    /// `None`.
    #[must_use]
    pub fn from_db(v: i64) -> DlErrorKind {
        match v {
            1 => DlErrorKind::BadTthl,
            2 => DlErrorKind::NotAvailable,
            3 => DlErrorKind::IoIncoming,
            4 => DlErrorKind::IoDestination,
            5 => DlErrorKind::HashMismatch,
            _ => DlErrorKind::None,
        }
    }
}

/// One file (or file list) being downloaded.
///
/// Keyed by TTH; file-list downloads use the pseudo-TTH of the user id.
#[derive(Debug)]
pub struct DlRecord {
    /// Identity and verification root
    pub tth: Tth,
    /// This is a file-list download
    pub is_list: bool,
    /// A verified TTHL is stored
    pub has_tthl: bool,
    /// Some peer is currently transferring this record
    pub active: bool,
    /// Scheduling priority
    pub priority: Priority,
    /// Sticky global error
    pub error: DlErrorKind,
    /// Human-readable error detail
    pub error_msg: Option<String>,
    /// Total size; 0 until known for lists
    pub size: u64,
    /// Bytes persisted to the incoming file
    pub have: u64,
    /// Final destination
    pub dest: PathBuf,
    /// Spool path, named by base32 TTH
    pub incoming: PathBuf,
    /// Open handle of the incoming file while receiving
    pub incoming_file: Option<std::fs::File>,
    /// Verification block size; meaningful once `has_tthl` or for
    /// below-threshold files
    pub hash_block_size: u64,
    /// Tiger-tree context of the block being received
    pub hash_ctx: Option<TthContext>,
    /// Stored TTHL leaves
    pub tthl: Option<Vec<[u8; TTH_BYTES]>>,
    /// Users associated with this record
    pub users: BTreeSet<Uid>,
    /// Open a browse tab once this list finishes
    pub list_open: bool,
    /// Run match-against-queue once this list finishes
    pub list_match: bool,
    /// Deletion requested while the receive task was running; freed at
    /// task end
    pub deleted: bool,
    /// A receive task currently owns the incoming file
    pub receiving: bool,
}

impl DlRecord {
    /// Fresh record with defaults.
    #[must_use]
    pub fn new(tth: Tth, is_list: bool, size: u64, dest: PathBuf, incoming: PathBuf) -> DlRecord {
        DlRecord {
            tth,
            is_list,
            has_tthl: false,
            active: false,
            priority: Priority::Med,
            error: DlErrorKind::None,
            error_msg: None,
            size,
            have: 0,
            dest,
            incoming,
            incoming_file: None,
            hash_block_size: 0,
            hash_ctx: None,
            tthl: None,
            users: BTreeSet::new(),
            list_open: false,
            list_match: false,
            deleted: false,
            receiving: false,
        }
    }

    /// Enabled and error-free: the scheduler may consider it.
    #[must_use]
    pub fn schedulable(&self) -> bool {
        self.priority.enabled() && self.error == DlErrorKind::None && !self.deleted
    }

    /// TTH of the expected hash for a given block index.
    #[must_use]
    pub fn block_hash(&self, index: usize) -> Option<Tth> {
        match &self.tthl {
            Some(leaves) => leaves.get(index).map(|l| Tth(*l)),
            // Below the TTHL threshold the root verifies the single
            // block.
            None => (index == 0).then_some(self.tth),
        }
    }
}
