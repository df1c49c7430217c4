//! Per-user download state and queue ordering.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use dctide_hash::Tth;

use super::record::{DlErrorKind, DlRecord};

/// Connection state of a user, as the orchestrator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserState {
    /// No session, none expected
    #[default]
    NotConnected,
    /// A connect was requested from the hub
    Expecting,
    /// Session established, nothing transferring
    Idle,
    /// A download is in flight
    Active,
    /// Backing off before the next attempt
    WaitingReconnect,
}

/// One entry in a user's queue: a download this user can serve, with
/// the user-specific error state.
#[derive(Debug, Clone)]
pub struct UserEntry {
    /// The download
    pub tth: Tth,
    /// Error against this user specifically
    pub error: DlErrorKind,
    /// Human-readable detail
    pub error_msg: Option<String>,
}

/// Per-user download bookkeeping.
#[derive(Debug, Default)]
pub struct UserDl {
    /// Connection state
    pub state: UserState,
    /// Priority-ordered queue; resort after any disposition change
    pub queue: Vec<UserEntry>,
    /// The entry currently transferring, when `state` is `Active`
    pub active: Option<Tth>,
    /// When the reconnect backoff expires
    pub reconnect_at: Option<Instant>,
}

impl UserDl {
    /// Find an entry by download.
    #[must_use]
    pub fn entry(&self, tth: &Tth) -> Option<&UserEntry> {
        self.queue.iter().find(|e| e.tth == *tth)
    }

    /// Find an entry mutably.
    pub fn entry_mut(&mut self, tth: &Tth) -> Option<&mut UserEntry> {
        self.queue.iter_mut().find(|e| e.tth == *tth)
    }

    /// Re-sort the queue. Mutations move-and-resort rather than
    /// reorder in place while anything iterates.
    pub fn sort(&mut self, records: &HashMap<Tth, DlRecord>) {
        self.queue
            .sort_by(|a, b| entry_cmp(a, b, records));
    }

    /// Best schedulable entry whose record is not already being
    /// transferred by another peer. Inspects at most the queue prefix.
    #[must_use]
    pub fn next_download<'q>(
        &'q self,
        records: &HashMap<Tth, DlRecord>,
    ) -> Option<&'q UserEntry> {
        self.queue.iter().find(|e| {
            e.error == DlErrorKind::None
                && records
                    .get(&e.tth)
                    .is_some_and(|r| r.schedulable() && !r.active)
        })
    }

    /// True when the scheduler should consider this user: some entry is
    /// enabled for it and nothing is transferring.
    #[must_use]
    pub fn has_work(&self, records: &HashMap<Tth, DlRecord>) -> bool {
        self.next_download(records).is_some()
    }
}

/// Total order over a user's entries.
///
/// Enabled before disabled, file lists before regular files, higher
/// priority first, destination path as the tiebreak, TTH as the final
/// discriminator so the order never ties.
#[must_use]
pub fn entry_cmp(
    a: &UserEntry,
    b: &UserEntry,
    records: &HashMap<Tth, DlRecord>,
) -> Ordering {
    let (ra, rb) = match (records.get(&a.tth), records.get(&b.tth)) {
        (Some(ra), Some(rb)) => (ra, rb),
        // Dangling entries sink; they are about to be dropped.
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        (None, None) => return a.tth.cmp(&b.tth),
    };
    let a_enabled = ra.schedulable() && a.error == DlErrorKind::None;
    let b_enabled = rb.schedulable() && b.error == DlErrorKind::None;
    b_enabled
        .cmp(&a_enabled)
        .then_with(|| rb.is_list.cmp(&ra.is_list))
        .then_with(|| rb.priority.cmp(&ra.priority))
        .then_with(|| ra.dest.cmp(&rb.dest))
        .then_with(|| a.tth.cmp(&b.tth))
}
