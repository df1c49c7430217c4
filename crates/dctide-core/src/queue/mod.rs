//! The download orchestrator's state: records, per-user queues, the
//! slot scheduler, verified block receipt, and queue persistence.

pub mod persist;
pub mod queue;
pub mod receive;
pub mod record;
pub mod select;
pub mod tthl;
pub mod users;

pub use queue::{DlQueue, MatchResult, QueueConfig, QueueEvent, RECONNECT_DELAY};
pub use receive::{ReceiveContext, ReceiveOutcome};
pub use record::{DlErrorKind, DlRecord, Priority};
pub use select::SelectOutcome;
pub use users::{UserDl, UserEntry, UserState};

use tracing::info;

use crate::user::Uid;
use dctide_hash::Tth;

impl DlQueue {
    /// Load the queue from the store at startup, re-open partial
    /// incoming files, and re-seed verification state.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures; individual malformed rows are
    /// skipped.
    pub fn load(&mut self) -> Result<(), crate::error::CoreError> {
        let (records, users) = persist::load_all(self.db())?;
        for loaded in records {
            // List records are the ones destined for fl/.
            let is_list = loaded.dest.starts_with(&self.cfg.filelist_dir);
            let incoming = self.cfg.incoming_dir.join(loaded.tth.to_base32());
            let mut rec =
                record::DlRecord::new(loaded.tth, is_list, loaded.size, loaded.dest, incoming);
            rec.priority = loaded.priority;
            rec.error = loaded.error;
            rec.error_msg = loaded.error_msg;
            if let Some(leaves) = loaded.tthl {
                rec.hash_block_size =
                    dctide_hash::block_size(loaded.size, leaves.len() as u64);
                rec.tthl = Some(leaves);
                rec.has_tthl = true;
            } else if !is_list && loaded.size < self.cfg.min_tthl_size {
                rec.hash_block_size = self.cfg.min_tthl_size;
            }
            self.records.insert(loaded.tth, rec);
        }
        for (tth, uid, error, msg) in users {
            let Some(rec) = self.records.get_mut(&tth) else {
                continue;
            };
            rec.users.insert(uid);
            let user = self.users.entry(uid).or_default();
            user.queue.push(users::UserEntry {
                tth,
                error,
                error_msg: msg,
            });
        }
        let uids: Vec<Uid> = self.users.keys().copied().collect();
        for uid in uids {
            if let Some(mut user) = self.users.remove(&uid) {
                user.sort(&self.records);
                self.users.insert(uid, user);
            }
        }
        let tths: Vec<Tth> = self.records.keys().copied().collect();
        for tth in &tths {
            self.resume_incoming(*tth);
        }
        info!(
            records = self.records.len(),
            users = self.users.len(),
            "download queue loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod load_tests {
    use super::queue::tests::queue_fixture;
    use super::*;

    #[test]
    fn test_queue_persistence_roundtrip() {
        let (svc, _dir, mut q, _rx) = queue_fixture();
        let t1 = Tth([1u8; 24]);
        q.add_file(Uid(1), t1, 4 << 20, "a/file.bin");
        q.add_file(Uid(2), t1, 4 << 20, "a/file.bin");
        q.set_priority(t1, Priority::High);
        q.add_list(Uid(3), false, false);
        q.set_user_error(Uid(2), Some(t1), DlErrorKind::NotAvailable, "gone");

        // Reload from the same store into a fresh queue.
        let (tx, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let mut q2 = DlQueue::new(q.cfg.clone(), svc.handle(), tx);
        q2.load().unwrap();

        assert_eq!(q2.len(), 2);
        let rec = q2.record(&t1).unwrap();
        assert_eq!(rec.priority, Priority::High);
        assert_eq!(rec.users.len(), 2);
        assert!(!rec.is_list);

        let list_rec = q2.record(&Uid(3).list_tth()).unwrap();
        assert!(list_rec.is_list);

        let entry = q2.user(Uid(2)).unwrap().entry(&t1).unwrap();
        assert_eq!(entry.error, DlErrorKind::NotAvailable);
        let entry = q2.user(Uid(1)).unwrap().entry(&t1).unwrap();
        assert_eq!(entry.error, DlErrorKind::None);
    }

    #[test]
    fn test_removed_record_stays_gone() {
        let (svc, _dir, mut q, _rx) = queue_fixture();
        let t1 = Tth([1u8; 24]);
        q.add_file(Uid(1), t1, 1 << 20, "x");
        q.remove(t1);

        let (tx, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let mut q2 = DlQueue::new(q.cfg.clone(), svc.handle(), tx);
        q2.load().unwrap();
        assert!(q2.is_empty());
    }
}
