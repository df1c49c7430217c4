//! The download queue.
//!
//! Central bookkeeping of every download record and every user's
//! per-user queue. Methods here are synchronous state transitions; the
//! orchestrator wraps them with timers, debounced selection and the
//! peer-session plumbing. Any method that could affect an in-flight
//! transfer documents the disconnect obligation: the caller must
//! force-disconnect the session before dropping an active entry.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dctide_db::DbHandle;
use dctide_filelist::{FileTree, NodeId};
use dctide_hash::Tth;

use crate::user::Uid;

use super::persist;
use super::record::{DlErrorKind, DlRecord, Priority};
use super::users::{UserDl, UserEntry, UserState};

/// Reconnect backoff after losing a peer.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Queue tuning and paths.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Where finished downloads land
    pub download_dir: PathBuf,
    /// Spool directory for partial downloads (`inc/`)
    pub incoming_dir: PathBuf,
    /// Directory for finished file lists (`fl/`)
    pub filelist_dir: PathBuf,
    /// Smallest acceptable TTHL block; leaves below it are coalesced
    pub min_block_size: u64,
    /// Files below this size skip TTHL and verify against the root
    pub min_tthl_size: u64,
    /// Hint the OS to drop cache for verified download bytes
    pub flush_file_cache: bool,
}

impl QueueConfig {
    /// Defaults rooted in a data directory.
    #[must_use]
    pub fn with_dirs(download_dir: PathBuf, incoming_dir: PathBuf, filelist_dir: PathBuf) -> Self {
        QueueConfig {
            download_dir,
            incoming_dir,
            filelist_dir,
            min_block_size: 1 << 20,
            min_tthl_size: 2 << 20,
            flush_file_cache: false,
        }
    }
}

/// Notifications toward the user-facing layer. Ordering is causal: a
/// user reported `Active` is reported `Idle` or `WaitingReconnect`
/// before anything else happens to it.
#[derive(Debug)]
pub enum QueueEvent {
    /// A record appeared
    RecordAdded(Tth),
    /// A record's disposition changed
    RecordChanged(Tth),
    /// A record left the queue
    RecordRemoved(Tth),
    /// A user's connection state changed
    UserState(Uid, UserState),
    /// A finished download was moved into place
    Finalized {
        /// The download
        tth: Tth,
        /// Where it landed
        dest: PathBuf,
    },
    /// A finished file list is ready for the collaborator
    ListFinished {
        /// Whose list
        uid: Uid,
        /// Path of the stored list
        path: PathBuf,
        /// Open a browse tab
        open: bool,
        /// Run match-against-queue
        match_queue: bool,
    },
}

/// Result of [`DlQueue::match_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// No record with this TTH
    NotInQueue,
    /// The user was already a source
    AlreadyAssociated,
    /// The user is now a source
    Associated,
}

/// The queue proper.
pub struct DlQueue {
    pub(crate) records: HashMap<Tth, DlRecord>,
    pub(crate) users: HashMap<Uid, UserDl>,
    pub(crate) cfg: QueueConfig,
    db: DbHandle,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl DlQueue {
    /// Empty queue.
    #[must_use]
    pub fn new(
        cfg: QueueConfig,
        db: DbHandle,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> DlQueue {
        DlQueue {
            records: HashMap::new(),
            users: HashMap::new(),
            cfg,
            db,
            events,
        }
    }

    pub(crate) fn emit(&self, ev: QueueEvent) {
        let _ = self.events.send(ev);
    }

    pub(crate) fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Borrow a record.
    #[must_use]
    pub fn record(&self, tth: &Tth) -> Option<&DlRecord> {
        self.records.get(tth)
    }

    /// Borrow a user.
    #[must_use]
    pub fn user(&self, uid: Uid) -> Option<&UserDl> {
        self.users.get(&uid)
    }

    /// Number of queued records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Incoming-file names referenced by the queue, for spool GC.
    #[must_use]
    pub fn referenced_incoming(&self) -> HashSet<OsString> {
        self.records
            .values()
            .filter_map(|r| r.incoming.file_name().map(OsString::from))
            .collect()
    }

    fn resort_user(&mut self, uid: Uid) {
        if let Some(mut user) = self.users.remove(&uid) {
            user.sort(&self.records);
            self.users.insert(uid, user);
        }
    }

    fn resort_users_of(&mut self, tth: &Tth) {
        let uids: Vec<Uid> = self
            .records
            .get(tth)
            .map(|r| r.users.iter().copied().collect())
            .unwrap_or_default();
        for uid in uids {
            self.resort_user(uid);
        }
    }

    fn associate(&mut self, uid: Uid, tth: Tth) -> bool {
        let Some(rec) = self.records.get_mut(&tth) else {
            return false;
        };
        if !rec.users.insert(uid) {
            return false;
        }
        let user = self.users.entry(uid).or_default();
        let entry = UserEntry {
            tth,
            error: DlErrorKind::None,
            error_msg: None,
        };
        persist::save_user(&self.db, &tth, uid, &entry);
        user.queue.push(entry);
        self.resort_user(uid);
        true
    }

    /// Queue a regular file for download.
    ///
    /// Creates the record if this TTH is new (persisting immediately)
    /// and associates the user. Returns true when anything changed.
    pub fn add_file(&mut self, uid: Uid, tth: Tth, size: u64, relative_name: &str) -> bool {
        if !self.records.contains_key(&tth) {
            let dest = self.cfg.download_dir.join(relative_name);
            let incoming = self.cfg.incoming_dir.join(tth.to_base32());
            let mut rec = DlRecord::new(tth, false, size, dest, incoming);
            if size < self.cfg.min_tthl_size {
                // Too small for a TTHL: one block, verified by the root.
                rec.hash_block_size = self.cfg.min_tthl_size;
            }
            persist::save_record(&self.db, &rec);
            self.records.insert(tth, rec);
            info!(%tth, size, "queued download {relative_name}");
            self.emit(QueueEvent::RecordAdded(tth));
            self.associate(uid, tth);
            return true;
        }
        let added = self.associate(uid, tth);
        if added {
            self.emit(QueueEvent::RecordChanged(tth));
        }
        added
    }

    /// Queue a user's file list, keyed by the pseudo-TTH of the id.
    pub fn add_list(&mut self, uid: Uid, open_after: bool, match_after: bool) -> bool {
        let tth = uid.list_tth();
        if let Some(rec) = self.records.get_mut(&tth) {
            rec.list_open |= open_after;
            rec.list_match |= match_after;
            return false;
        }
        let dest = self.cfg.filelist_dir.join(format!("{}.xml.bz2", uid.to_hex()));
        let incoming = self.cfg.incoming_dir.join(tth.to_base32());
        let mut rec = DlRecord::new(tth, true, 0, dest, incoming);
        rec.list_open = open_after;
        rec.list_match = match_after;
        persist::save_record(&self.db, &rec);
        self.records.insert(tth, rec);
        info!(%uid, "queued file list");
        self.emit(QueueEvent::RecordAdded(tth));
        self.associate(uid, tth);
        true
    }

    /// Queue every file of a browsed subtree.
    ///
    /// The exclusion predicate applies to descendants only; a file
    /// passed as the root is always added. Returns the number of files
    /// queued.
    pub fn add_tree(
        &mut self,
        uid: Uid,
        tree: &FileTree,
        node: NodeId,
        exclude: Option<&dyn Fn(&str) -> bool>,
    ) -> usize {
        self.add_tree_walk(uid, tree, node, PathBuf::new(), exclude, true)
    }

    fn add_tree_walk(
        &mut self,
        uid: Uid,
        tree: &FileTree,
        node: NodeId,
        rel: PathBuf,
        exclude: Option<&dyn Fn(&str) -> bool>,
        is_root: bool,
    ) -> usize {
        let n = tree.node(node);
        if !is_root && exclude.is_some_and(|f| f(n.name())) {
            debug!(name = n.name(), "excluded from queue");
            return 0;
        }
        if n.is_file() {
            let Some(tth) = n.tth() else {
                return 0;
            };
            let rel = rel.join(n.name());
            let added = self.add_file(uid, tth, n.size(), &rel.to_string_lossy());
            return usize::from(added);
        }
        let rel = rel.join(n.name());
        let mut count = 0;
        for &child in n.children() {
            count += self.add_tree_walk(uid, tree, child, rel.clone(), exclude, false);
        }
        count
    }

    /// Associate a newly-known source with an existing download.
    pub fn match_file(&mut self, uid: Uid, tth: Tth) -> MatchResult {
        if !self.records.contains_key(&tth) {
            return MatchResult::NotInQueue;
        }
        if self.associate(uid, tth) {
            self.emit(QueueEvent::RecordChanged(tth));
            MatchResult::Associated
        } else {
            MatchResult::AlreadyAssociated
        }
    }

    /// Change a record's priority. Leaving `Error` this way also clears
    /// the sticky error.
    pub fn set_priority(&mut self, tth: Tth, priority: Priority) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        rec.priority = priority;
        if priority != Priority::Error && rec.error != DlErrorKind::None {
            rec.error = DlErrorKind::None;
            rec.error_msg = None;
        }
        persist::save_record_state(&self.db, rec);
        self.resort_users_of(&tth);
        self.emit(QueueEvent::RecordChanged(tth));
    }

    /// Set a sticky global error; demotes priority to `Error` until the
    /// user clears it.
    pub fn set_error(&mut self, tth: Tth, kind: DlErrorKind, msg: impl Into<String>) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        let msg = msg.into();
        warn!(%tth, ?kind, "download error: {msg}");
        rec.error = kind;
        rec.error_msg = Some(msg);
        rec.priority = Priority::Error;
        persist::save_record_state(&self.db, rec);
        self.resort_users_of(&tth);
        self.emit(QueueEvent::RecordChanged(tth));
    }

    /// Set (or clear with `DlErrorKind::None`) a user's error against
    /// one download, or against all of the user's entries when `tth` is
    /// `None`.
    pub fn set_user_error(
        &mut self,
        uid: Uid,
        tth: Option<Tth>,
        kind: DlErrorKind,
        msg: impl Into<String>,
    ) {
        let msg = msg.into();
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        let msg_opt = (kind != DlErrorKind::None).then_some(msg);
        let mut touched = Vec::new();
        for entry in &mut user.queue {
            if tth.is_none_or(|t| t == entry.tth) {
                entry.error = kind;
                entry.error_msg = msg_opt.clone();
                touched.push((entry.tth, entry.clone()));
            }
        }
        for (t, entry) in &touched {
            persist::save_user(&self.db, t, uid, entry);
        }
        self.resort_user(uid);
        for (t, _) in touched {
            self.emit(QueueEvent::RecordChanged(t));
        }
    }

    /// Drop a user from one download, or from all of its downloads when
    /// `tth` is `None`.
    ///
    /// The caller must have force-disconnected the user's session first
    /// if one of the dropped entries is actively transferring; this
    /// method clears the active pointer before dropping the entry.
    pub fn remove_user(&mut self, uid: Uid, tth: Option<Tth>) {
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        let dropped: Vec<Tth> = user
            .queue
            .iter()
            .filter(|e| tth.is_none_or(|t| t == e.tth))
            .map(|e| e.tth)
            .collect();
        if dropped.is_empty() {
            return;
        }
        let mut went_idle = false;
        if let Some(active) = user.active {
            if dropped.contains(&active) {
                user.active = None;
                went_idle = user.state == UserState::Active;
                if let Some(rec) = self.records.get_mut(&active) {
                    rec.active = false;
                }
            }
        }
        if went_idle {
            self.set_user_state(uid, UserState::Idle);
        }
        let user = self.users.get_mut(&uid).expect("still present");
        user.queue.retain(|e| !dropped.contains(&e.tth));
        let empty = user.queue.is_empty();
        if empty {
            self.users.remove(&uid);
            self.emit(QueueEvent::UserState(uid, UserState::NotConnected));
        }

        match tth {
            None => persist::delete_user_all(&self.db, uid),
            Some(t) => persist::delete_user(&self.db, &t, uid),
        }
        for t in dropped {
            if let Some(rec) = self.records.get_mut(&t) {
                rec.users.remove(&uid);
            }
            self.emit(QueueEvent::RecordChanged(t));
        }
    }

    /// Delete a record.
    ///
    /// While a receive task holds the record the deletion is deferred;
    /// the task performs the free when it finishes.
    pub fn remove(&mut self, tth: Tth) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        if rec.receiving {
            debug!(%tth, "deletion deferred until receive task ends");
            rec.deleted = true;
            return;
        }
        self.remove_now(tth);
    }

    pub(crate) fn remove_now(&mut self, tth: Tth) {
        let Some(rec) = self.records.remove(&tth) else {
            return;
        };
        let mut went_idle = Vec::new();
        for uid in &rec.users {
            if let Some(user) = self.users.get_mut(uid) {
                if user.active == Some(tth) {
                    user.active = None;
                    if user.state == UserState::Active {
                        went_idle.push(*uid);
                    }
                }
                user.queue.retain(|e| e.tth != tth);
                if user.queue.is_empty() {
                    self.users.remove(uid);
                }
            }
        }
        for uid in went_idle {
            self.set_user_state(uid, UserState::Idle);
        }
        if rec.incoming.exists() {
            if let Err(e) = std::fs::remove_file(&rec.incoming) {
                warn!("cannot remove incoming file: {e}");
            }
        }
        persist::delete_record(&self.db, &tth);
        self.emit(QueueEvent::RecordRemoved(tth));
    }

    fn set_user_state(&mut self, uid: Uid, state: UserState) {
        let user = self.users.entry(uid).or_default();
        if user.state == state {
            return;
        }
        user.state = state;
        user.reconnect_at = (state == UserState::WaitingReconnect)
            .then(|| Instant::now() + RECONNECT_DELAY);
        self.emit(QueueEvent::UserState(uid, state));
    }

    /// Peer-session report: handshake complete (`connected`) or the
    /// session is gone.
    pub fn user_cc(&mut self, uid: Uid, connected: bool) {
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        if connected {
            self.set_user_state(uid, UserState::Idle);
            return;
        }
        // Any loss out of Expecting/Idle/Active backs off before the
        // next attempt.
        if let Some(active) = user.active.take() {
            if let Some(rec) = self.records.get_mut(&active) {
                rec.active = false;
            }
        }
        match user.state {
            UserState::Expecting | UserState::Idle | UserState::Active => {
                self.set_user_state(uid, UserState::WaitingReconnect);
            }
            UserState::NotConnected | UserState::WaitingReconnect => {}
        }
    }

    /// The active transfer's current range finished; the user returns
    /// to `Idle` and the record frees its slot.
    pub fn transfer_done(&mut self, uid: Uid) {
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        if let Some(active) = user.active.take() {
            if let Some(rec) = self.records.get_mut(&active) {
                rec.active = false;
            }
        }
        if user.state == UserState::Active {
            self.set_user_state(uid, UserState::Idle);
        }
    }

    /// Reconnect backoffs that have expired; each user returns to
    /// `NotConnected` so selection can retry it.
    pub fn expire_reconnects(&mut self, now: Instant) -> usize {
        let expired: Vec<Uid> = self
            .users
            .iter()
            .filter(|(_, u)| {
                u.state == UserState::WaitingReconnect
                    && u.reconnect_at.is_some_and(|at| at <= now)
            })
            .map(|(&uid, _)| uid)
            .collect();
        let n = expired.len();
        for uid in expired {
            self.set_user_state(uid, UserState::NotConnected);
        }
        n
    }

    /// Earliest pending reconnect deadline, for the orchestrator's
    /// timer.
    #[must_use]
    pub fn next_reconnect(&self) -> Option<Instant> {
        self.users
            .values()
            .filter(|u| u.state == UserState::WaitingReconnect)
            .filter_map(|u| u.reconnect_at)
            .min()
    }
}
