//! The download orchestrator.
//!
//! Owns the queue, the open peer sessions and the receive contexts, and
//! drives them with two timers: a 500 ms debounce between a state
//! change and the next selection pass, and the reconnect backoff that
//! returns waiting users to the candidate pool.
//!
//! Locking: everything lives behind one mutex, taken only for short
//! synchronous transitions; no await happens under it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use dctide_filelist::{FileTree, NodeId};
use dctide_hash::Tth;

use crate::cc::CcEvent;
use crate::queue::{
    DlErrorKind, DlQueue, MatchResult, Priority, ReceiveContext, SelectOutcome,
};
use crate::session::{HubApi, PeerSession};
use crate::user::Uid;

/// Debounce between a schedule request and the selection pass.
pub const SCHEDULE_DEBOUNCE: Duration = Duration::from_millis(500);

struct Inner {
    queue: DlQueue,
    sessions: HashMap<Uid, Box<dyn PeerSession>>,
    receives: HashMap<Uid, ReceiveContext>,
    hubs: Box<dyn HubApi>,
    slots: u32,
}

/// The orchestrator handle. Cheap to clone via `Arc`.
pub struct Orchestrator {
    inner: Mutex<Inner>,
    schedule_tx: mpsc::UnboundedSender<()>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its driver task.
    #[must_use]
    pub fn start(queue: DlQueue, hubs: Box<dyn HubApi>, slots: u32) -> Arc<Orchestrator> {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let orch = Arc::new(Orchestrator {
            inner: Mutex::new(Inner {
                queue,
                sessions: HashMap::new(),
                receives: HashMap::new(),
                hubs,
                slots,
            }),
            schedule_tx,
        });
        tokio::spawn(drive(Arc::clone(&orch), schedule_rx));
        orch
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("orchestrator lock")
    }

    /// Request a (debounced) selection pass.
    pub fn schedule(&self) {
        let _ = self.schedule_tx.send(());
    }

    /// Change the configured concurrent-download count.
    pub fn set_slots(&self, slots: u32) {
        self.lock().slots = slots.max(1);
        self.schedule();
    }

    // ---- queue surface ----------------------------------------------------

    /// See [`DlQueue::add_file`].
    pub fn add_file(&self, uid: Uid, tth: Tth, size: u64, relative_name: &str) -> bool {
        let added = self.lock().queue.add_file(uid, tth, size, relative_name);
        self.schedule();
        added
    }

    /// See [`DlQueue::add_list`].
    pub fn add_list(&self, uid: Uid, open_after: bool, match_after: bool) -> bool {
        let added = self.lock().queue.add_list(uid, open_after, match_after);
        self.schedule();
        added
    }

    /// See [`DlQueue::add_tree`].
    pub fn add_tree(
        &self,
        uid: Uid,
        tree: &FileTree,
        node: NodeId,
        exclude: Option<&dyn Fn(&str) -> bool>,
    ) -> usize {
        let n = self.lock().queue.add_tree(uid, tree, node, exclude);
        self.schedule();
        n
    }

    /// See [`DlQueue::match_file`].
    pub fn match_file(&self, uid: Uid, tth: Tth) -> MatchResult {
        let r = self.lock().queue.match_file(uid, tth);
        if r == MatchResult::Associated {
            self.schedule();
        }
        r
    }

    /// See [`DlQueue::set_priority`].
    pub fn set_priority(&self, tth: Tth, priority: Priority) {
        self.lock().queue.set_priority(tth, priority);
        self.schedule();
    }

    /// See [`DlQueue::set_error`].
    pub fn set_error(&self, tth: Tth, kind: DlErrorKind, msg: impl Into<String>) {
        self.lock().queue.set_error(tth, kind, msg);
        self.schedule();
    }

    /// See [`DlQueue::set_user_error`].
    pub fn set_user_error(
        &self,
        uid: Uid,
        tth: Option<Tth>,
        kind: DlErrorKind,
        msg: impl Into<String>,
    ) {
        self.lock().queue.set_user_error(uid, tth, kind, msg);
        self.schedule();
    }

    /// Drop a user from one or all downloads, force-disconnecting its
    /// session first when it is transferring one of them.
    pub fn remove_user(&self, uid: Uid, tth: Option<Tth>) {
        {
            let mut inner = self.lock();
            let transferring = inner
                .queue
                .user(uid)
                .and_then(|u| u.active)
                .is_some_and(|active| tth.is_none_or(|t| t == active));
            if transferring {
                if let Some(session) = inner.sessions.get_mut(&uid) {
                    session.disconnect(true);
                }
            }
            inner.queue.remove_user(uid, tth);
        }
        self.schedule();
    }

    /// Delete a record, force-disconnecting whoever transfers it.
    pub fn remove(&self, tth: Tth) {
        {
            let mut inner = self.lock();
            let transferring: Option<Uid> = inner
                .queue
                .record(&tth)
                .filter(|r| r.active)
                .and_then(|r| {
                    r.users
                        .iter()
                        .copied()
                        .find(|u| inner.queue.user(*u).and_then(|ud| ud.active) == Some(tth))
                });
            if let Some(uid) = transferring {
                if let Some(session) = inner.sessions.get_mut(&uid) {
                    session.disconnect(true);
                }
            }
            inner.queue.remove(tth);
        }
        self.schedule();
    }

    /// Run a closure against the queue, read-only.
    pub fn with_queue<R>(&self, f: impl FnOnce(&DlQueue) -> R) -> R {
        f(&self.lock().queue)
    }

    // ---- session plumbing -------------------------------------------------

    /// The hub layer opened a session for a user; store its handle.
    /// The `Established` event still gates scheduling onto it.
    pub fn attach_session(&self, uid: Uid, session: Box<dyn PeerSession>) {
        self.lock().sessions.insert(uid, session);
    }

    /// Dispatch one session report.
    pub fn on_cc_event(&self, ev: CcEvent) {
        match ev {
            CcEvent::Established(uid) => {
                info!(%uid, "peer session established");
                self.lock().queue.user_cc(uid, true);
                self.schedule();
            }
            CcEvent::Gone(uid) => {
                debug!(%uid, "peer session gone");
                {
                    let mut inner = self.lock();
                    let inner = &mut *inner;
                    inner.sessions.remove(&uid);
                    if let Some(ctx) = inner.receives.remove(&uid) {
                        ctx.finish(&mut inner.queue);
                    }
                    inner.queue.user_cc(uid, false);
                }
                self.schedule();
            }
            CcEvent::Tthl { uid, tth, blob } => {
                {
                    let mut inner = self.lock();
                    inner.queue.set_tthl(uid, tth, &blob);
                    inner.queue.transfer_done(uid);
                }
                self.schedule();
            }
            CcEvent::Data { uid, bytes } => {
                let mut inner = self.lock();
                let inner = &mut *inner;
                if !inner.receives.contains_key(&uid) {
                    let Some(active) = inner.queue.user(uid).and_then(|u| u.active) else {
                        debug!(%uid, "data with no active download, dropping");
                        return;
                    };
                    match ReceiveContext::start(&mut inner.queue, uid, active) {
                        Some(ctx) => {
                            inner.receives.insert(uid, ctx);
                        }
                        None => return,
                    }
                }
                let ctx = inner.receives.get_mut(&uid).expect("inserted above");
                if !ctx.recv_data(&mut inner.queue, &bytes) {
                    // Verification or I/O stopped the transfer; the
                    // session is no longer useful for this range.
                    let ctx = inner.receives.remove(&uid).expect("present");
                    ctx.finish(&mut inner.queue);
                    inner.queue.transfer_done(uid);
                    if let Some(session) = inner.sessions.get_mut(&uid) {
                        session.disconnect(true);
                    }
                    self.schedule();
                }
            }
            CcEvent::DataEnd(uid) => {
                {
                    let mut inner = self.lock();
                    let inner = &mut *inner;
                    if let Some(ctx) = inner.receives.remove(&uid) {
                        let is_list = inner
                            .queue
                            .record(&ctx.tth)
                            .is_some_and(|r| r.is_list);
                        if is_list {
                            ctx.finish_list(&mut inner.queue);
                        } else {
                            ctx.finish(&mut inner.queue);
                        }
                    }
                    inner.queue.transfer_done(uid);
                }
                self.schedule();
            }
            CcEvent::NotAvailable { uid, tth } => {
                {
                    let mut inner = self.lock();
                    inner
                        .queue
                        .set_user_error(uid, tth, DlErrorKind::NotAvailable, "file not available");
                    inner.queue.transfer_done(uid);
                }
                self.schedule();
            }
        }
    }

    fn run_select(&self) -> SelectOutcome {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner
            .queue
            .select_pass(&mut *inner.hubs, &mut inner.sessions, inner.slots)
    }

    fn expire_and_next(&self) -> Option<Instant> {
        let mut inner = self.lock();
        if inner.queue.expire_reconnects(Instant::now()) > 0 {
            drop(inner);
            self.schedule();
            return None;
        }
        inner.queue.next_reconnect()
    }
}

async fn drive(orch: Arc<Orchestrator>, mut schedule_rx: mpsc::UnboundedReceiver<()>) {
    loop {
        let next_reconnect = orch.expire_and_next();
        let reconnect_sleep = async {
            match next_reconnect {
                Some(at) => {
                    tokio::time::sleep(at.saturating_duration_since(Instant::now())).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            req = schedule_rx.recv() => {
                if req.is_none() {
                    return;
                }
                tokio::time::sleep(SCHEDULE_DEBOUNCE).await;
                // One pass serves every request that queued up while
                // debouncing.
                while schedule_rx.try_recv().is_ok() {}
                let outcome = orch.run_select();
                if !outcome.connects.is_empty() || !outcome.started.is_empty() {
                    debug!(
                        connects = outcome.connects.len(),
                        started = outcome.started.len(),
                        "selection pass"
                    );
                }
            }
            () = reconnect_sleep => {
                // Loop re-runs expiry.
            }
        }
    }
}
