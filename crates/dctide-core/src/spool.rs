//! The on-disk data directory.
//!
//! A configurable root holds everything the engine persists:
//! `logs/`, `inc/` (incoming downloads named by base32 TTH), `fl/`
//! (downloaded file lists), `cert/` (the client TLS pair), the SQLite
//! store, and a 2-byte `version` file held under an exclusive advisory
//! lock for the process lifetime to assert sole ownership.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use dctide_hash::Tth;

use crate::error::CoreError;
use crate::user::Uid;

/// Data-directory format version written to the lock file.
const DIR_VERSION: (u8, u8) = (1, 0);

const SUBDIRS: &[&str] = &["logs", "inc", "fl", "cert"];

/// An opened, locked data directory.
pub struct SpoolDir {
    root: PathBuf,
    // Held open for the advisory lock; the lock dies with the fd.
    _lock: File,
}

impl SpoolDir {
    /// Create (if needed) and lock the data directory.
    ///
    /// # Errors
    ///
    /// [`CoreError::DataDir`] when the root cannot be created or
    /// written, [`CoreError::Locked`] when another process holds the
    /// lock. Both are fatal to startup.
    pub fn open(root: impl Into<PathBuf>) -> Result<SpoolDir, CoreError> {
        let root = root.into();
        let datadir_err = |e: &dyn std::fmt::Display| CoreError::DataDir {
            path: root.display().to_string(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&root).map_err(|e| datadir_err(&e))?;
        for sub in SUBDIRS {
            fs::create_dir_all(root.join(sub)).map_err(|e| datadir_err(&e))?;
        }

        let lock_path = root.join("version");
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| datadir_err(&e))?;

        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(CoreError::Locked);
        }

        let mut existing = [0u8; 2];
        match lock.read(&mut existing) {
            Ok(2) => {
                debug!(
                    "data directory version {}.{}",
                    existing[0], existing[1]
                );
            }
            _ => {
                lock.write_all(&[DIR_VERSION.0, DIR_VERSION.1])
                    .map_err(|e| datadir_err(&e))?;
            }
        }

        info!(path = %root.display(), "data directory locked");
        Ok(SpoolDir { root, _lock: lock })
    }

    /// Directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the SQLite store.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join("db.sqlite3")
    }

    /// Incoming-spool path of a download, named by base32 TTH.
    #[must_use]
    pub fn incoming_path(&self, tth: &Tth) -> PathBuf {
        self.root.join("inc").join(tth.to_base32())
    }

    /// Path of a user's downloaded file list.
    #[must_use]
    pub fn filelist_path(&self, uid: Uid) -> PathBuf {
        self.root.join("fl").join(format!("{}.xml.bz2", uid.to_hex()))
    }

    /// Client certificate pair used for peer TLS; a collaborator
    /// generator creates these if absent.
    #[must_use]
    pub fn cert_paths(&self) -> (PathBuf, PathBuf) {
        let cert = self.root.join("cert");
        (cert.join("client.crt"), cert.join("client.key"))
    }

    /// Delete incoming-spool files no queued record references.
    pub fn gc_incoming(&self, referenced: &HashSet<OsString>) {
        let inc = self.root.join("inc");
        let Ok(entries) = fs::read_dir(&inc) else {
            return;
        };
        for entry in entries.flatten() {
            if !referenced.contains(&entry.file_name()) {
                debug!(file = %entry.file_name().to_string_lossy(), "removing stale incoming file");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("cannot remove stale incoming file: {e}");
                }
            }
        }
    }

    /// Delete downloaded file lists older than `maxage`. Zero disables.
    pub fn gc_filelists(&self, maxage: Duration) {
        if maxage.is_zero() {
            return;
        }
        let fl = self.root.join("fl");
        let Ok(entries) = fs::read_dir(&fl) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age > maxage);
            if old {
                debug!(file = %entry.file_name().to_string_lossy(), "removing aged file list");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("cannot remove aged file list: {e}");
                }
            }
        }
    }
}
