//! Store schema and version gate.

use rusqlite::Connection;
use tracing::info;

use crate::error::DbError;
use crate::DB_VERSION;

const CREATE: &str = "
CREATE TABLE IF NOT EXISTS hashdata (
    root TEXT NOT NULL PRIMARY KEY,
    size INTEGER NOT NULL,
    tthl BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS hashfiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    tth TEXT NOT NULL,
    lastmod INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS dl (
    tth TEXT NOT NULL PRIMARY KEY,
    size INTEGER NOT NULL,
    dest TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    error INTEGER NOT NULL DEFAULT 0,
    error_msg TEXT,
    tthl BLOB
);
CREATE TABLE IF NOT EXISTS dl_users (
    tth TEXT NOT NULL,
    uid INTEGER NOT NULL,
    error INTEGER NOT NULL DEFAULT 0,
    error_msg TEXT,
    PRIMARY KEY (tth, uid)
);
CREATE TABLE IF NOT EXISTS share (
    name TEXT NOT NULL PRIMARY KEY,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS vars (
    name TEXT NOT NULL,
    hub INTEGER NOT NULL DEFAULT 0,
    value TEXT NOT NULL,
    PRIMARY KEY (name, hub)
);
";

fn user_version(conn: &Connection) -> Result<i32, DbError> {
    conn.query_row("PRAGMA user_version", [], |r| r.get(0))
        .map_err(|e| DbError::Open(e.to_string()))
}

/// Check the `user_version` gate and create the schema on a fresh store.
///
/// # Errors
///
/// [`DbError::SchemaTooOld`] / [`DbError::SchemaTooNew`] on a version
/// mismatch, [`DbError::Open`] on anything SQLite refuses.
pub fn init(conn: &Connection) -> Result<(), DbError> {
    let found = user_version(conn)?;
    match found {
        0 => {
            info!("initializing fresh store at schema version {DB_VERSION}");
            conn.execute_batch(CREATE)
                .map_err(|e| DbError::Open(e.to_string()))?;
            conn.pragma_update(None, "user_version", DB_VERSION)
                .map_err(|e| DbError::Open(e.to_string()))?;
            Ok(())
        }
        v if v == DB_VERSION => Ok(()),
        v if v < DB_VERSION => Err(DbError::SchemaTooOld {
            found: v,
            need: DB_VERSION,
        }),
        v => Err(DbError::SchemaTooNew {
            found: v,
            need: DB_VERSION,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_store_initializes() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        assert_eq!(user_version(&conn).unwrap(), DB_VERSION);
        // Idempotent at the right version.
        init(&conn).unwrap();
        conn.execute(
            "INSERT INTO vars (name, hub, value) VALUES ('nick', 0, 'tester')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_newer_store_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", DB_VERSION + 1)
            .unwrap();
        assert!(matches!(
            init(&conn),
            Err(DbError::SchemaTooNew { .. })
        ));
    }
}
