//! TTHL receipt and startup resume.

use std::io::{Read, Seek, SeekFrom};

use tracing::{debug, info, warn};

use dctide_hash::{block_size, leaves_from_blob, tth_root, Tth, TthContext, TTH_BYTES};

use crate::user::Uid;

use super::persist;
use super::queue::DlQueue;
use super::record::DlErrorKind;

/// Coalesce a leaf row in groups of four until its block size reaches
/// `min_block`. Each pass replaces four adjacent leaves with the root
/// of their subtree, quadrupling the block size.
pub(crate) fn coalesce_leaves(
    mut leaves: Vec<[u8; TTH_BYTES]>,
    mut bs: u64,
    min_block: u64,
) -> (Vec<[u8; TTH_BYTES]>, u64) {
    while bs < min_block && leaves.len() > 1 {
        leaves = leaves
            .chunks(4)
            .map(|group| tth_root(group).0)
            .collect();
        bs *= 4;
    }
    (leaves, bs)
}

impl DlQueue {
    /// A peer session delivered the tree leaves for a download.
    ///
    /// Validates the row against the file root; a mismatch is the
    /// user's fault (`BadTthl` against that user). A valid row is
    /// coalesced up to the minimum block size and persisted.
    pub fn set_tthl(&mut self, uid: Uid, tth: Tth, blob: &[u8]) {
        let Some(rec) = self.records.get(&tth) else {
            return;
        };
        if rec.has_tthl || rec.is_list || rec.size < self.cfg.min_tthl_size {
            debug!(%tth, "ignoring unexpected TTHL");
            return;
        }
        let size = rec.size;

        let leaves = match leaves_from_blob(blob) {
            Ok(l) if !l.is_empty() && tth_root(&l) == tth => l,
            _ => {
                warn!(%tth, %uid, "TTHL does not hash to the file root");
                self.set_user_error(uid, Some(tth), DlErrorKind::BadTthl, "bad TTHL data");
                return;
            }
        };

        let native = block_size(size, leaves.len() as u64);
        let (leaves, bs) = coalesce_leaves(leaves, native, self.cfg.min_block_size);
        info!(%tth, leaves = leaves.len(), block_size = bs, "TTHL verified");

        let rec = self.records.get_mut(&tth).expect("checked above");
        rec.tthl = Some(leaves);
        rec.hash_block_size = bs;
        rec.has_tthl = true;
        let db = self.db();
        persist::save_tthl(db, self.records.get(&tth).expect("checked above"));
    }

    /// Re-open a partial incoming file at startup: round `have` down to
    /// a whole block, truncate the spill, and verify the last whole
    /// block against the stored hashes. A block that no longer matches
    /// is a `HashMismatch` at its own boundary.
    pub fn resume_incoming(&mut self, tth: Tth) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        if rec.is_list {
            return;
        }
        let on_disk = match std::fs::metadata(&rec.incoming) {
            Ok(m) => m.len(),
            Err(_) => {
                rec.have = 0;
                return;
            }
        };
        let bs = rec.hash_block_size;
        if bs == 0 {
            // No TTHL yet: nothing is verifiable, start over.
            rec.have = 0;
            return;
        }
        let mut have = (on_disk.min(rec.size) / bs) * bs;

        // Verify the last whole block; resume trusts disk content only
        // as far as the hashes do.
        let mut mismatch = false;
        if have > 0 {
            let index = (have / bs - 1) as usize;
            let start = index as u64 * bs;
            let len = (rec.size - start).min(bs);
            match hash_file_range(&rec.incoming, start, len) {
                Ok(got) => {
                    if rec.block_hash(index) != Some(got) {
                        warn!(%tth, index, "resumed block fails verification");
                        have = start;
                        mismatch = true;
                    }
                }
                Err(e) => {
                    warn!(%tth, "cannot rehash incoming file: {e}");
                    have = 0;
                }
            }
        }

        if let Err(e) = truncate_file(&rec.incoming, have) {
            warn!(%tth, "cannot truncate incoming file: {e}");
            rec.have = 0;
            return;
        }
        rec.have = have;
        debug!(%tth, have, "resumed incoming file");
        if mismatch {
            let index = have / bs;
            self.set_error(
                tth,
                DlErrorKind::HashMismatch,
                format!("block {index} failed verification on resume"),
            );
        }
    }
}

fn hash_file_range(path: &std::path::Path, start: u64, len: u64) -> std::io::Result<Tth> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut ctx = TthContext::new();
    let mut remaining = len;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(ctx.finalize())
}

fn truncate_file(path: &std::path::Path, len: u64) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctide_hash::leaves_to_blob;

    fn leaf_of(data: &[u8]) -> [u8; 24] {
        let mut ctx = TthContext::new();
        ctx.update(data);
        ctx.finalize().0
    }

    #[test]
    fn test_coalesce_groups_of_four() {
        // 16 leaves of 256 KiB blocks collapse to 4 leaves of 1 MiB.
        let leaves: Vec<[u8; 24]> = (0..16u8).map(|i| [i; 24]).collect();
        let root_before = tth_root(&leaves);
        let (coalesced, bs) = coalesce_leaves(leaves, 256 * 1024, 1 << 20);
        assert_eq!(coalesced.len(), 4);
        assert_eq!(bs, 1 << 20);
        // Coalescing only reshapes the tree bottom; the root stands.
        assert_eq!(tth_root(&coalesced), root_before);
    }

    #[test]
    fn test_coalesce_noop_at_or_above_floor() {
        let leaves: Vec<[u8; 24]> = (0..4u8).map(|i| [i; 24]).collect();
        let (same, bs) = coalesce_leaves(leaves.clone(), 1 << 20, 1 << 20);
        assert_eq!(same, leaves);
        assert_eq!(bs, 1 << 20);
    }

    #[test]
    fn test_coalesce_overshoot_is_fine() {
        // 512 KiB blocks jump straight to 2 MiB.
        let leaves: Vec<[u8; 24]> = (0..8u8).map(|i| [i; 24]).collect();
        let (coalesced, bs) = coalesce_leaves(leaves, 512 * 1024, 1 << 20);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(bs, 2 << 20);
    }

    mod with_queue {
        use super::super::super::queue::tests::queue_fixture;
        use super::*;
        use crate::queue::record::Priority;
        use std::io::Write;

        // Build a file whose 4 MiB content has a real TTHL of 4 leaves.
        fn content() -> (Vec<u8>, Tth, Vec<[u8; 24]>) {
            let data: Vec<u8> = (0..4 << 20u32).map(|i| (i % 241) as u8).collect();
            let leaves: Vec<[u8; 24]> = data.chunks(1 << 20).map(leaf_of).collect();
            let root = tth_root(&leaves);
            (data, root, leaves)
        }

        #[test]
        fn test_set_tthl_accepts_valid_row() {
            let (_svc, _dir, mut q, _rx) = queue_fixture();
            let (_, root, leaves) = content();
            q.add_file(crate::user::Uid(1), root, 4 << 20, "f");
            q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));
            let rec = q.record(&root).unwrap();
            assert!(rec.has_tthl);
            assert_eq!(rec.hash_block_size, 1 << 20);
            assert_eq!(rec.tthl.as_ref().unwrap().len(), 4);
        }

        #[test]
        fn test_set_tthl_rejects_bad_row() {
            let (_svc, _dir, mut q, _rx) = queue_fixture();
            let (_, root, mut leaves) = content();
            leaves[1][0] ^= 1;
            q.add_file(crate::user::Uid(1), root, 4 << 20, "f");
            q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));
            let rec = q.record(&root).unwrap();
            assert!(!rec.has_tthl);
            let entry = q.user(crate::user::Uid(1)).unwrap().entry(&root).unwrap();
            assert_eq!(entry.error, DlErrorKind::BadTthl);
            // Still schedulable globally; only this source is tainted.
            assert_eq!(rec.priority, Priority::Med);
        }

        #[test]
        fn test_resume_rounds_down_and_verifies() {
            let (_svc, _dir, mut q, _rx) = queue_fixture();
            let (data, root, leaves) = content();
            q.add_file(crate::user::Uid(1), root, 4 << 20, "f");
            q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));

            // 2.5 MiB on disk: resume keeps 2 whole blocks.
            let incoming = q.record(&root).unwrap().incoming.clone();
            std::fs::create_dir_all(incoming.parent().unwrap()).unwrap();
            let mut f = std::fs::File::create(&incoming).unwrap();
            f.write_all(&data[..(2 << 20) + (1 << 19)]).unwrap();
            drop(f);

            q.resume_incoming(root);
            let rec = q.record(&root).unwrap();
            assert_eq!(rec.have, 2 << 20);
            assert_eq!(std::fs::metadata(&incoming).unwrap().len(), 2 << 20);
            assert_eq!(rec.error, DlErrorKind::None);
            std::fs::remove_file(&incoming).ok();
        }

        #[test]
        fn test_resume_mismatch_flags_record() {
            let (_svc, _dir, mut q, _rx) = queue_fixture();
            let (mut data, root, leaves) = content();
            q.add_file(crate::user::Uid(1), root, 4 << 20, "f");
            q.set_tthl(crate::user::Uid(1), root, &leaves_to_blob(&leaves));

            // Corrupt the second block on disk.
            data[(1 << 20) + 17] ^= 0xFF;
            let incoming = q.record(&root).unwrap().incoming.clone();
            std::fs::create_dir_all(incoming.parent().unwrap()).unwrap();
            std::fs::write(&incoming, &data[..2 << 20]).unwrap();

            q.resume_incoming(root);
            let rec = q.record(&root).unwrap();
            assert_eq!(rec.have, 1 << 20);
            assert_eq!(rec.error, DlErrorKind::HashMismatch);
            assert_eq!(std::fs::metadata(&incoming).unwrap().len(), 1 << 20);
            std::fs::remove_file(&incoming).ok();
        }
    }
}
