//! The key/value configuration surface.
//!
//! A flat `(hub-id, name) -> string` store backed by the `vars` table;
//! hub id 0 is global scope. Values are validated on the way in, with
//! per-option rules matching what the hub side of the protocol can
//! tolerate (nick charset, slot minimums, interval floors).

use dctide_db::{queries, DbHandle, Param};
use dctide_hash::parse_interval;

use crate::error::CoreError;

/// Hub scope of a variable; 0 is global.
pub type HubId = i64;

/// Global scope marker.
pub const GLOBAL: HubId = 0;

/// Per-hub TLS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Never offer TLS
    Disabled,
    /// Accept TLS when the peer insists
    #[default]
    Allow,
    /// Prefer TLS when both sides support it
    Prefer,
}

impl TlsPolicy {
    fn parse(s: &str) -> Option<TlsPolicy> {
        match s {
            "disabled" => Some(TlsPolicy::Disabled),
            "allow" => Some(TlsPolicy::Allow),
            "prefer" => Some(TlsPolicy::Prefer),
            _ => None,
        }
    }
}

/// Parse the boolean vocabulary shared by every boolean option.
#[must_use]
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "t" | "y" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "n" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

const NICK_MAX: usize = 32;
const NICK_FORBIDDEN: &[char] = &['$', '|', ' ', '<', '>'];
const AUTOREFRESH_MIN: u64 = 600;

fn bad(name: &str, reason: impl Into<String>) -> CoreError {
    CoreError::BadConfig {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validate one option value against its per-name rule.
///
/// # Errors
///
/// [`CoreError::UnknownOption`] for names outside the recognized set,
/// [`CoreError::BadConfig`] for a value the option rejects.
pub fn validate(name: &str, value: &str) -> Result<(), CoreError> {
    match name {
        "nick" => {
            if value.is_empty() {
                return Err(bad(name, "a nick is required"));
            }
            if value.len() > NICK_MAX {
                return Err(bad(name, format!("longer than {NICK_MAX} bytes")));
            }
            if value.contains(NICK_FORBIDDEN) {
                return Err(bad(name, "may not contain '$', '|', spaces, '<' or '>'"));
            }
            Ok(())
        }
        "email" | "description" | "connection" | "download_dir" | "incoming_dir"
        | "local_address" => Ok(()),
        "autorefresh" => {
            let secs = parse_interval(value).map_err(|e| bad(name, e.to_string()))?;
            if secs != 0 && secs < AUTOREFRESH_MIN {
                return Err(bad(name, format!("must be 0 or at least {AUTOREFRESH_MIN}s")));
            }
            Ok(())
        }
        "filelist_maxage" => {
            parse_interval(value).map_err(|e| bad(name, e.to_string()))?;
            Ok(())
        }
        "slots" => match value.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(()),
            _ => Err(bad(name, "must be a number of at least 1")),
        },
        "download_slots" => match value.parse::<u32>() {
            Ok(_) => Ok(()),
            Err(_) => Err(bad(name, "must be a number")),
        },
        "active_port" | "active_udp_port" | "active_tls_port" => match value.parse::<u16>() {
            Ok(_) => Ok(()),
            Err(_) => Err(bad(name, "must be a port number")),
        },
        "flush_file_cache" | "log_debug" | "log_downloads" | "log_uploads" | "active" => {
            parse_bool(value)
                .map(|_| ())
                .ok_or_else(|| bad(name, "not a boolean"))
        }
        "tls_policy" => TlsPolicy::parse(value)
            .map(|_| ())
            .ok_or_else(|| bad(name, "one of: disabled, allow, prefer")),
        _ => Err(CoreError::UnknownOption(name.to_string())),
    }
}

/// Typed view over the `vars` table.
///
/// Reads block on the persistence reply channel; call through
/// `spawn_blocking` from async contexts.
#[derive(Clone)]
pub struct Vars {
    db: DbHandle,
}

impl Vars {
    /// Wrap a persistence handle.
    #[must_use]
    pub fn new(db: DbHandle) -> Vars {
        Vars { db }
    }

    /// Raw read. `None` when unset in this scope.
    #[must_use]
    pub fn get_raw(&self, hub: HubId, name: &str) -> Option<String> {
        let rows = self
            .db
            .fetch(
                queries::VARS_GET,
                vec![Param::Text(name.to_string()), Param::I64(hub)],
            )
            .ok()?;
        rows.first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_text().map(str::to_string))
    }

    /// Read with fall-through from hub scope to global.
    #[must_use]
    pub fn get(&self, hub: HubId, name: &str) -> Option<String> {
        if hub != GLOBAL {
            if let Some(v) = self.get_raw(hub, name) {
                return Some(v);
            }
        }
        self.get_raw(GLOBAL, name)
    }

    /// Validate and persist.
    ///
    /// # Errors
    ///
    /// The validation failure; the write itself is queued and
    /// asynchronous.
    pub fn set(&self, hub: HubId, name: &str, value: &str) -> Result<(), CoreError> {
        validate(name, value)?;
        self.db.exec(
            queries::VARS_SET,
            vec![
                Param::Text(name.to_string()),
                Param::I64(hub),
                Param::Text(value.to_string()),
            ],
        );
        Ok(())
    }

    /// Remove a variable from one scope.
    pub fn unset(&self, hub: HubId, name: &str) {
        self.db.exec(
            queries::VARS_DELETE,
            vec![Param::Text(name.to_string()), Param::I64(hub)],
        );
    }

    /// Boolean option with a default.
    #[must_use]
    pub fn get_bool(&self, hub: HubId, name: &str, default: bool) -> bool {
        self.get(hub, name)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    /// Integer option with a default.
    #[must_use]
    pub fn get_u32(&self, hub: HubId, name: &str, default: u32) -> u32 {
        self.get(hub, name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Interval option in seconds, with a default.
    #[must_use]
    pub fn get_interval(&self, hub: HubId, name: &str, default: u64) -> u64 {
        self.get(hub, name)
            .and_then(|v| parse_interval(&v).ok())
            .unwrap_or(default)
    }

    /// TLS policy for a hub.
    #[must_use]
    pub fn tls_policy(&self, hub: HubId) -> TlsPolicy {
        self.get(hub, "tls_policy")
            .and_then(|v| TlsPolicy::parse(&v))
            .unwrap_or_default()
    }

    /// Upload slot count (global).
    #[must_use]
    pub fn slots(&self) -> u32 {
        self.get_u32(GLOBAL, "slots", 10).max(1)
    }

    /// Concurrent download count (global).
    #[must_use]
    pub fn download_slots(&self) -> u32 {
        self.get_u32(GLOBAL, "download_slots", 3).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctide_db::DbService;

    fn vars() -> (DbService, Vars) {
        let svc = DbService::open_in_memory().unwrap();
        let v = Vars::new(svc.handle());
        (svc, v)
    }

    #[test]
    fn test_set_then_get() {
        let (_svc, v) = vars();
        v.set(GLOBAL, "nick", "alice").unwrap();
        assert_eq!(v.get(GLOBAL, "nick").as_deref(), Some("alice"));
        v.set(GLOBAL, "nick", "bob").unwrap();
        assert_eq!(v.get(GLOBAL, "nick").as_deref(), Some("bob"));
    }

    #[test]
    fn test_hub_scope_falls_through() {
        let (_svc, v) = vars();
        v.set(GLOBAL, "tls_policy", "prefer").unwrap();
        assert_eq!(v.tls_policy(7), TlsPolicy::Prefer);
        v.set(7, "tls_policy", "disabled").unwrap();
        assert_eq!(v.tls_policy(7), TlsPolicy::Disabled);
        assert_eq!(v.tls_policy(8), TlsPolicy::Prefer);
        v.unset(7, "tls_policy");
        assert_eq!(v.tls_policy(7), TlsPolicy::Prefer);
    }

    #[test]
    fn test_nick_validation() {
        let (_svc, v) = vars();
        assert!(v.set(GLOBAL, "nick", "has space").is_err());
        assert!(v.set(GLOBAL, "nick", "pipe|char").is_err());
        assert!(v.set(GLOBAL, "nick", "").is_err());
        assert!(v.set(GLOBAL, "nick", &"x".repeat(33)).is_err());
        assert!(v.set(GLOBAL, "nick", &"x".repeat(32)).is_ok());
    }

    #[test]
    fn test_autorefresh_floor() {
        let (_svc, v) = vars();
        assert!(v.set(GLOBAL, "autorefresh", "0").is_ok());
        assert!(v.set(GLOBAL, "autorefresh", "599").is_err());
        assert!(v.set(GLOBAL, "autorefresh", "10m").is_ok());
        assert_eq!(v.get_interval(GLOBAL, "autorefresh", 0), 600);
    }

    #[test]
    fn test_slot_minimums() {
        let (_svc, v) = vars();
        assert!(v.set(GLOBAL, "slots", "0").is_err());
        assert!(v.set(GLOBAL, "slots", "4").is_ok());
        assert_eq!(v.slots(), 4);
    }

    #[test]
    fn test_boolean_vocabulary() {
        for t in ["1", "t", "y", "true", "YES", "on"] {
            assert_eq!(parse_bool(t), Some(true), "{t}");
        }
        for f in ["0", "f", "n", "false", "NO", "off"] {
            assert_eq!(parse_bool(f), Some(false), "{f}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let (_svc, v) = vars();
        assert!(matches!(
            v.set(GLOBAL, "no_such_option", "1"),
            Err(CoreError::UnknownOption(_))
        ));
    }
}
