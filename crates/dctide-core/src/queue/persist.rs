//! Queue persistence.
//!
//! Every queue mutation is pushed to the persistence service as it
//! happens; the service batches the writes. Loading happens once at
//! startup, before the async machinery spins up, so the blocking reply
//! reads here are harmless.

use std::path::PathBuf;
use std::str::FromStr;

use dctide_db::{queries, DbHandle, Param};
use dctide_hash::{leaves_from_blob, leaves_to_blob, Tth};
use tracing::warn;

use crate::error::CoreError;
use crate::user::Uid;

use super::record::{DlErrorKind, DlRecord, Priority};
use super::users::UserEntry;

pub(crate) fn save_record(db: &DbHandle, rec: &DlRecord) {
    db.exec(
        queries::DL_UPSERT,
        vec![
            Param::Text(rec.tth.to_base32()),
            Param::I64(rec.size as i64),
            Param::Text(rec.dest.to_string_lossy().into_owned()),
            Param::I64(rec.priority.to_db()),
            Param::I64(rec.error.to_db()),
            rec.error_msg
                .as_ref()
                .map_or(Param::Null, |m| Param::Text(m.clone())),
            rec.tthl
                .as_ref()
                .map_or(Param::Null, |l| Param::Blob(leaves_to_blob(l))),
        ],
    );
}

pub(crate) fn save_record_state(db: &DbHandle, rec: &DlRecord) {
    db.exec(
        queries::DL_SET_STATE,
        vec![
            Param::Text(rec.tth.to_base32()),
            Param::I64(rec.priority.to_db()),
            Param::I64(rec.error.to_db()),
            rec.error_msg
                .as_ref()
                .map_or(Param::Null, |m| Param::Text(m.clone())),
        ],
    );
}

pub(crate) fn save_tthl(db: &DbHandle, rec: &DlRecord) {
    db.exec(
        queries::DL_SET_TTHL,
        vec![
            Param::Text(rec.tth.to_base32()),
            rec.tthl
                .as_ref()
                .map_or(Param::Null, |l| Param::Blob(leaves_to_blob(l))),
        ],
    );
}

pub(crate) fn delete_record(db: &DbHandle, tth: &Tth) {
    // The record and its user rows go in one transaction.
    db.exec_with(
        queries::DL_DELETE,
        vec![Param::Text(tth.to_base32())],
        dctide_db::Flags {
            chain_next: true,
            ..Default::default()
        },
    );
    db.exec(queries::DL_USERS_OF_DELETE, vec![Param::Text(tth.to_base32())]);
}

pub(crate) fn save_user(db: &DbHandle, tth: &Tth, uid: Uid, entry: &UserEntry) {
    db.exec(
        queries::DL_USER_UPSERT,
        vec![
            Param::Text(tth.to_base32()),
            Param::I64(uid.0 as i64),
            Param::I64(entry.error.to_db()),
            entry
                .error_msg
                .as_ref()
                .map_or(Param::Null, |m| Param::Text(m.clone())),
        ],
    );
}

pub(crate) fn delete_user(db: &DbHandle, tth: &Tth, uid: Uid) {
    db.exec(
        queries::DL_USER_DELETE,
        vec![Param::Text(tth.to_base32()), Param::I64(uid.0 as i64)],
    );
}

pub(crate) fn delete_user_all(db: &DbHandle, uid: Uid) {
    db.exec(queries::DL_USER_DELETE_ALL, vec![Param::I64(uid.0 as i64)]);
}

/// Record the finished file in the hash tables so the share layer can
/// serve it without rehashing.
pub(crate) fn save_hashdata(db: &DbHandle, rec: &DlRecord) {
    let Some(leaves) = &rec.tthl else { return };
    db.exec(
        queries::HASHDATA_UPSERT,
        vec![
            Param::Text(rec.tth.to_base32()),
            Param::I64(rec.size as i64),
            Param::Blob(leaves_to_blob(leaves)),
        ],
    );
    db.exec(
        queries::HASHFILES_UPSERT,
        vec![
            Param::Text(rec.dest.to_string_lossy().into_owned()),
            Param::Text(rec.tth.to_base32()),
            Param::I64(0),
        ],
    );
}

/// A download row as loaded from the store.
pub(crate) struct LoadedRecord {
    pub tth: Tth,
    pub size: u64,
    pub dest: PathBuf,
    pub priority: Priority,
    pub error: DlErrorKind,
    pub error_msg: Option<String>,
    pub tthl: Option<Vec<[u8; 24]>>,
}

/// Load all records and user associations.
///
/// Malformed rows are logged and skipped rather than aborting startup.
pub(crate) fn load_all(
    db: &DbHandle,
) -> Result<(Vec<LoadedRecord>, Vec<(Tth, Uid, DlErrorKind, Option<String>)>), CoreError> {
    let mut records = Vec::new();
    for row in db.fetch(queries::DL_LOAD, vec![])? {
        let parse = || -> Option<LoadedRecord> {
            let tth = Tth::from_str(row.first()?.as_text()?).ok()?;
            let size = row.get(1)?.as_i64()? as u64;
            let dest = PathBuf::from(row.get(2)?.as_text()?);
            let priority = Priority::from_db(row.get(3)?.as_i64()?);
            let error = DlErrorKind::from_db(row.get(4)?.as_i64()?);
            let error_msg = row.get(5)?.as_text().map(str::to_string);
            let tthl = row
                .get(6)
                .and_then(|v| v.as_blob())
                .and_then(|b| leaves_from_blob(b).ok());
            Some(LoadedRecord {
                tth,
                size,
                dest,
                priority,
                error,
                error_msg,
                tthl,
            })
        };
        match parse() {
            Some(rec) => records.push(rec),
            None => warn!("skipping malformed dl row"),
        }
    }

    let mut users = Vec::new();
    for row in db.fetch(queries::DL_USERS_LOAD, vec![])? {
        let parse = || -> Option<(Tth, Uid, DlErrorKind, Option<String>)> {
            let tth = Tth::from_str(row.first()?.as_text()?).ok()?;
            let uid = Uid(row.get(1)?.as_i64()? as u64);
            let error = DlErrorKind::from_db(row.get(2)?.as_i64()?);
            let msg = row.get(3)?.as_text().map(str::to_string);
            Some((tth, uid, error, msg))
        };
        match parse() {
            Some(u) => users.push(u),
            None => warn!("skipping malformed dl_users row"),
        }
    }

    Ok((records, users))
}
