//! Static query templates.
//!
//! Every template is a `&'static str` constant; the service's statement
//! cache is keyed by this text, so callers must submit these constants
//! rather than building SQL at runtime.

/// Insert or replace a download record.
pub const DL_UPSERT: &str = "INSERT OR REPLACE INTO dl \
    (tth, size, dest, priority, error, error_msg, tthl) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Update disposition fields of a download record.
pub const DL_SET_STATE: &str =
    "UPDATE dl SET priority = ?2, error = ?3, error_msg = ?4 WHERE tth = ?1";

/// Store the (possibly shrunk) TTHL of a download.
pub const DL_SET_TTHL: &str = "UPDATE dl SET tthl = ?2 WHERE tth = ?1";

/// Delete a download record.
pub const DL_DELETE: &str = "DELETE FROM dl WHERE tth = ?1";

/// Load every download record.
pub const DL_LOAD: &str =
    "SELECT tth, size, dest, priority, error, error_msg, tthl FROM dl";

/// Associate a user with a download.
pub const DL_USER_UPSERT: &str = "INSERT OR REPLACE INTO dl_users \
    (tth, uid, error, error_msg) VALUES (?1, ?2, ?3, ?4)";

/// Drop one user association.
pub const DL_USER_DELETE: &str = "DELETE FROM dl_users WHERE tth = ?1 AND uid = ?2";

/// Drop every association of one user.
pub const DL_USER_DELETE_ALL: &str = "DELETE FROM dl_users WHERE uid = ?1";

/// Drop every user of one download.
pub const DL_USERS_OF_DELETE: &str = "DELETE FROM dl_users WHERE tth = ?1";

/// Load every user association.
pub const DL_USERS_LOAD: &str = "SELECT tth, uid, error, error_msg FROM dl_users";

/// Insert or replace a hashed-file root.
pub const HASHDATA_UPSERT: &str =
    "INSERT OR REPLACE INTO hashdata (root, size, tthl) VALUES (?1, ?2, ?3)";

/// Fetch the TTHL blob of a root.
pub const HASHDATA_GET: &str = "SELECT size, tthl FROM hashdata WHERE root = ?1";

/// Map a shared filename to its hash.
pub const HASHFILES_UPSERT: &str = "INSERT OR REPLACE INTO hashfiles \
    (filename, tth, lastmod) VALUES (?1, ?2, ?3)";

/// Look up a shared filename.
pub const HASHFILES_GET: &str =
    "SELECT id, tth, lastmod FROM hashfiles WHERE filename = ?1";

/// Add a share root.
pub const SHARE_UPSERT: &str =
    "INSERT OR REPLACE INTO share (name, path) VALUES (?1, ?2)";

/// Remove a share root.
pub const SHARE_DELETE: &str = "DELETE FROM share WHERE name = ?1";

/// Load every share root.
pub const SHARE_LOAD: &str = "SELECT name, path FROM share";

/// Set a configuration variable.
pub const VARS_SET: &str =
    "INSERT OR REPLACE INTO vars (name, hub, value) VALUES (?1, ?2, ?3)";

/// Read a configuration variable.
pub const VARS_GET: &str = "SELECT value FROM vars WHERE name = ?1 AND hub = ?2";

/// Unset a configuration variable.
pub const VARS_DELETE: &str = "DELETE FROM vars WHERE name = ?1 AND hub = ?2";

/// Load every configuration variable.
pub const VARS_LOAD: &str = "SELECT name, hub, value FROM vars";
