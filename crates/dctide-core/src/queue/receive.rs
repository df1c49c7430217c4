//! Block receipt, verification and finalization.
//!
//! A receive task owns a [`ReceiveContext`] for the duration of one
//! transfer. Bytes are appended to the incoming file at `have`, hashed
//! into the record's running Tiger-tree context, and verified at every
//! block boundary. A mismatch rewinds `have` to the start of the failed
//! block, truncates the spill, and stops the transfer with a per-user
//! error. While the context lives, the record cannot be freed; deletion
//! is deferred to [`ReceiveContext::finish`].

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use dctide_hash::{Tth, TthContext};

use crate::user::Uid;

use super::persist;
use super::queue::{DlQueue, QueueEvent};
use super::record::DlErrorKind;

/// State of one receive task.
#[derive(Debug)]
pub struct ReceiveContext {
    /// The download being received
    pub tth: Tth,
    /// The transferring user
    pub uid: Uid,
    /// Global error to apply when the task ends
    pending_error: Option<(DlErrorKind, String)>,
    /// Per-user error to apply when the task ends
    pending_user_error: Option<(DlErrorKind, String)>,
    /// Bytes already hinted out of the page cache
    fadvised: u64,
    /// Receipt is over; further bytes are discarded
    stopped: bool,
}

/// What [`ReceiveContext::finish`] concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Transfer ended mid-file; the record stays queued
    Incomplete,
    /// The record was deleted during the transfer
    Deleted,
    /// `have` reached `size` and the file moved into place
    Finalized,
    /// `have` reached `size` but the move failed; queued for retry
    DestinationFailed,
}

impl ReceiveContext {
    /// Begin receiving into a record.
    ///
    /// Marks the record as owned by a receive task: deletion defers
    /// until [`ReceiveContext::finish`].
    pub fn start(queue: &mut DlQueue, uid: Uid, tth: Tth) -> Option<ReceiveContext> {
        let rec = queue.records.get_mut(&tth)?;
        if rec.receiving {
            warn!(%tth, "refusing second receive task for one record");
            return None;
        }
        rec.receiving = true;
        if rec.hash_ctx.is_none() {
            rec.hash_ctx = Some(TthContext::new());
        }
        // Make sure the incoming file exists even if no byte ever
        // arrives (a zero-size file finalizes straight away).
        if let Some(parent) = rec.incoming.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if !rec.incoming.exists() {
            if let Err(e) = std::fs::File::create(&rec.incoming) {
                warn!(%tth, "cannot create incoming file: {e}");
            }
        }
        debug!(%tth, %uid, have = rec.have, "receive task started");
        Some(ReceiveContext {
            tth,
            uid,
            pending_error: None,
            pending_user_error: None,
            fadvised: rec.have,
            stopped: false,
        })
    }

    /// True once the task should stop feeding data.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one received chunk.
    ///
    /// Returns false when receiving must stop (error or verification
    /// failure); the pending error is applied by
    /// [`ReceiveContext::finish`].
    pub fn recv_data(&mut self, queue: &mut DlQueue, mut data: &[u8]) -> bool {
        if self.stopped {
            return false;
        }
        let flush_cache = queue.cfg.flush_file_cache;
        let Some(rec) = queue.records.get_mut(&self.tth) else {
            self.stopped = true;
            return false;
        };

        // Lists stream without hashing; their size is unknown.
        if rec.is_list {
            if let Err(e) = append_at(&rec.incoming, &mut rec.incoming_file, rec.have, data) {
                self.pending_error = Some((DlErrorKind::IoIncoming, e.to_string()));
                self.stopped = true;
                return false;
            }
            rec.have += data.len() as u64;
            return true;
        }

        while !data.is_empty() {
            if rec.have >= rec.size {
                // Peer overran the requested range.
                warn!(tth = %self.tth, "discarding bytes past end of file");
                self.stopped = true;
                return false;
            }
            let bs = rec.hash_block_size.max(1);
            let block_off = rec.have % bs;
            let until_boundary = (bs - block_off).min(rec.size - rec.have);
            let take = (until_boundary as usize).min(data.len());
            let chunk = &data[..take];
            data = &data[take..];

            if let Err(e) = append_at(&rec.incoming, &mut rec.incoming_file, rec.have, chunk) {
                self.pending_error = Some((DlErrorKind::IoIncoming, e.to_string()));
                self.stopped = true;
                return false;
            }
            rec.hash_ctx.get_or_insert_with(TthContext::new).update(chunk);
            rec.have += chunk.len() as u64;

            // Block boundary or end of file: settle the block.
            if rec.have % bs == 0 || rec.have == rec.size {
                let index = ((rec.have - 1) / bs) as usize;
                let got = rec
                    .hash_ctx
                    .take()
                    .expect("context exists while receiving")
                    .finalize();
                match rec.block_hash(index) {
                    Some(want) if want == got => {
                        rec.hash_ctx = Some(TthContext::new());
                        debug!(tth = %self.tth, index, "block verified");
                        if flush_cache {
                            self.advise_done(rec);
                        }
                    }
                    _ => {
                        let start = index as u64 * bs;
                        warn!(tth = %self.tth, index, "block hash mismatch, rewinding to {start}");
                        rec.have = start;
                        rec.hash_ctx = Some(TthContext::new());
                        if let Err(e) = truncate_incoming(rec, start) {
                            self.pending_error =
                                Some((DlErrorKind::IoIncoming, e.to_string()));
                        }
                        self.pending_user_error = Some((
                            DlErrorKind::HashMismatch,
                            format!("block {index} failed verification"),
                        ));
                        self.stopped = true;
                        return false;
                    }
                }
            }

            if rec.have == rec.size {
                self.stopped = true;
                return false;
            }
        }
        true
    }

    /// Hint verified bytes out of the page cache; they will not be
    /// read again before finalization.
    fn advise_done(&mut self, rec: &super::record::DlRecord) {
        #[cfg(target_os = "linux")]
        if let Some(file) = &rec.incoming_file {
            use std::os::fd::AsRawFd;
            let len = rec.have.saturating_sub(self.fadvised);
            if len > 0 {
                unsafe {
                    libc::posix_fadvise(
                        file.as_raw_fd(),
                        self.fadvised as libc::off_t,
                        len as libc::off_t,
                        libc::POSIX_FADV_DONTNEED,
                    );
                }
            }
        }
        self.fadvised = rec.have;
    }

    /// End the receive task: perform a deferred deletion, apply pending
    /// errors, and finalize a completed file.
    pub fn finish(self, queue: &mut DlQueue) -> ReceiveOutcome {
        let Some(rec) = queue.records.get_mut(&self.tth) else {
            return ReceiveOutcome::Deleted;
        };
        rec.receiving = false;
        rec.incoming_file = None;

        if rec.deleted {
            info!(tth = %self.tth, "applying deferred deletion");
            queue.remove_now(self.tth);
            return ReceiveOutcome::Deleted;
        }

        if let Some((kind, msg)) = self.pending_error {
            queue.set_error(self.tth, kind, msg);
            return ReceiveOutcome::Incomplete;
        }
        if let Some((kind, msg)) = self.pending_user_error {
            queue.set_user_error(self.uid, Some(self.tth), kind, msg);
            return ReceiveOutcome::Incomplete;
        }

        let rec = queue.records.get(&self.tth).expect("present above");
        if rec.have == rec.size && !(rec.is_list && rec.size == 0 && rec.have == 0) {
            return finalize(queue, self.tth, self.uid);
        }
        ReceiveOutcome::Incomplete
    }

    /// A list transfer learned its total size (lists start at zero and
    /// complete only when the session says so).
    pub fn finish_list(self, queue: &mut DlQueue) -> ReceiveOutcome {
        if let Some(rec) = queue.records.get_mut(&self.tth) {
            if rec.is_list {
                rec.size = rec.have;
            }
        }
        self.finish(queue)
    }
}

fn append_at(
    path: &Path,
    handle: &mut Option<std::fs::File>,
    offset: u64,
    data: &[u8],
) -> std::io::Result<()> {
    if handle.is_none() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        *handle = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)?,
        );
    }
    let file = handle.as_mut().expect("opened above");
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

fn truncate_incoming(
    rec: &mut super::record::DlRecord,
    len: u64,
) -> std::io::Result<()> {
    rec.incoming_file = None;
    let file = OpenOptions::new().write(true).open(&rec.incoming)?;
    file.set_len(len)
}

/// Pick a destination that does not collide: `name`, `name.1`,
/// `name.2`, ...
fn collision_free(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}.{n}", dest.display()));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn finalize(queue: &mut DlQueue, tth: Tth, uid: Uid) -> ReceiveOutcome {
    let rec = queue.records.get(&tth).expect("caller checked");
    let is_list = rec.is_list;
    let incoming = rec.incoming.clone();
    let dest = if is_list {
        // Lists land on a fixed name; the previous copy is replaced.
        rec.dest.clone()
    } else {
        collision_free(&rec.dest)
    };

    if let Some(parent) = dest.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            queue.set_error(tth, DlErrorKind::IoDestination, e.to_string());
            return ReceiveOutcome::DestinationFailed;
        }
    }
    if let Err(e) = std::fs::rename(&incoming, &dest) {
        // The record stays queued; the user can retry once the
        // destination is writable again.
        queue.set_error(tth, DlErrorKind::IoDestination, e.to_string());
        return ReceiveOutcome::DestinationFailed;
    }

    info!(%tth, dest = %dest.display(), "download finalized");
    let rec = queue.records.get(&tth).expect("still present");
    let (list_open, list_match) = (rec.list_open, rec.list_match);
    if !is_list {
        persist::save_hashdata(queue.db(), rec);
    }
    queue.remove_now(tth);
    if is_list {
        queue.emit(QueueEvent::ListFinished {
            uid,
            path: dest,
            open: list_open,
            match_queue: list_match,
        });
    } else {
        queue.emit(QueueEvent::Finalized { tth, dest });
    }
    ReceiveOutcome::Finalized
}

#[cfg(test)]
mod tests {
    use super::super::queue::tests::queue_fixture;
    use super::*;
    use dctide_hash::{leaves_to_blob, tth_root};

    fn leaf_of(data: &[u8]) -> [u8; 24] {
        let mut ctx = TthContext::new();
        ctx.update(data);
        ctx.finalize().0
    }

    fn content(len: usize) -> (Vec<u8>, Tth, Vec<[u8; 24]>) {
        let data: Vec<u8> = (0..len as u32).map(|i| (i % 239) as u8).collect();
        let leaves: Vec<[u8; 24]> = data.chunks(1 << 20).map(leaf_of).collect();
        let root = tth_root(&leaves);
        (data, root, leaves)
    }

    #[test]
    fn test_full_receive_and_finalize() {
        let (_svc, _dir, mut q, mut rx) = queue_fixture();
        let (data, root, leaves) = content(4 << 20);
        q.add_file(crate::user::Uid(1), root, 4 << 20, "sub/file.bin");
        q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));

        let incoming = q.record(&root).unwrap().incoming.clone();
        let dest = q.record(&root).unwrap().dest.clone();

        let mut ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        for chunk in data.chunks(64 * 1024 + 13) {
            if !ctx.recv_data(&mut q, chunk) {
                break;
            }
        }
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Finalized);

        assert!(q.record(&root).is_none());
        assert!(!incoming.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        let mut finalized = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, QueueEvent::Finalized { .. }) {
                finalized = true;
            }
        }
        assert!(finalized);
    }

    #[test]
    fn test_mismatch_rewinds_and_truncates() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let (mut data, root, leaves) = content(4 << 20);
        q.add_file(crate::user::Uid(1), root, 4 << 20, "f.bin");
        q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));

        // Flip the last byte of the second block.
        data[(2 << 20) - 1] ^= 0xFF;

        let mut ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        let mut fed = 0usize;
        for chunk in data.chunks(64 * 1024) {
            fed += chunk.len();
            if !ctx.recv_data(&mut q, chunk) {
                break;
            }
        }
        // Receipt stopped inside the second block.
        assert_eq!(fed, 2 << 20);
        let incoming = q.record(&root).unwrap().incoming.clone();
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Incomplete);

        let rec = q.record(&root).unwrap();
        assert_eq!(rec.have, 1 << 20);
        assert_eq!(std::fs::metadata(&incoming).unwrap().len(), 1 << 20);
        // The error is the user's, not the record's.
        assert_eq!(rec.error, DlErrorKind::None);
        let entry = q
            .user(crate::user::Uid(1))
            .unwrap()
            .entry(&root)
            .unwrap();
        assert_eq!(entry.error, DlErrorKind::HashMismatch);
    }

    #[test]
    fn test_small_file_verifies_against_root() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        let root = {
            let mut c = TthContext::new();
            c.update(&data);
            c.finalize()
        };
        q.add_file(crate::user::Uid(1), root, data.len() as u64, "small.bin");

        let mut ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        ctx.recv_data(&mut q, &data);
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Finalized);
    }

    #[test]
    fn test_deferred_deletion_applies_at_finish() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let (data, root, leaves) = content(4 << 20);
        q.add_file(crate::user::Uid(1), root, 4 << 20, "f.bin");
        q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));

        let mut ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        ctx.recv_data(&mut q, &data[..1 << 20]);
        q.remove(root);
        assert!(q.record(&root).unwrap().deleted);
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Deleted);
        assert!(q.record(&root).is_none());
    }

    #[test]
    fn test_second_receive_task_refused() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let (_, root, _) = content(4 << 20);
        q.add_file(crate::user::Uid(1), root, 4 << 20, "f.bin");
        let _ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        assert!(ReceiveContext::start(&mut q, crate::user::Uid(2), root).is_none());
    }

    #[test]
    fn test_list_receive_streams_unhashed() {
        let (_svc, _dir, mut q, mut rx) = queue_fixture();
        let uid = crate::user::Uid(9);
        q.add_list(uid, true, false);
        let tth = uid.list_tth();

        let payload = b"list-bytes-from-the-peer".repeat(100);
        let mut ctx = ReceiveContext::start(&mut q, uid, tth).unwrap();
        assert!(ctx.recv_data(&mut q, &payload));
        assert_eq!(ctx.finish_list(&mut q), ReceiveOutcome::Finalized);

        let mut list_done = None;
        while let Ok(ev) = rx.try_recv() {
            if let QueueEvent::ListFinished { path, open, .. } = ev {
                list_done = Some((path, open));
            }
        }
        let (path, open) = list_done.expect("list finished event");
        assert!(open);
        assert_eq!(std::fs::read(path).unwrap(), payload);
    }

    #[test]
    fn test_zero_size_list_not_autocompleted() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let uid = crate::user::Uid(3);
        q.add_list(uid, false, false);
        let tth = uid.list_tth();

        let ctx = ReceiveContext::start(&mut q, uid, tth).unwrap();
        // No data arrived; a zero-size list must not finalize.
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Incomplete);
        assert!(q.record(&tth).is_some());
    }

    #[test]
    fn test_collision_suffix() {
        let (_svc, _dir, mut q, _rx) = queue_fixture();
        let data: Vec<u8> = vec![7u8; 50_000];
        let root = {
            let mut c = TthContext::new();
            c.update(&data);
            c.finalize()
        };
        q.add_file(crate::user::Uid(1), root, data.len() as u64, "taken.bin");
        let dest = q.record(&root).unwrap().dest.clone();
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"already here").unwrap();

        let mut ctx = ReceiveContext::start(&mut q, crate::user::Uid(1), root).unwrap();
        ctx.recv_data(&mut q, &data);
        assert_eq!(ctx.finish(&mut q), ReceiveOutcome::Finalized);

        assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
        let renamed = PathBuf::from(format!("{}.1", dest.display()));
        assert_eq!(std::fs::read(&renamed).unwrap(), data);
    }
}
