//! Session validation against an external session store.
//!
//! Sessions are issued elsewhere (passkey login); the relay only reads them.
//! A session is valid while younger than the configured TTL and while the
//! connecting address matches the one it was issued to.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use clawtime_core::now_millis;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub ip: String,
    pub created_at: i64,
}

/// Read side of the session store.
pub trait SessionStore: Send + Sync {
    fn lookup(&self, token: &str) -> Result<Option<Session>, AuthError>;
}

/// Sessions kept in a JSON document `{token: {ip, createdAt}}`, re-read on
/// every lookup so sessions issued by another process are seen immediately.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    path: PathBuf,
}

impl JsonSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonSessionStore {
    fn lookup(&self, token: &str) -> Result<Option<Session>, AuthError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AuthError::Store(e.to_string())),
        };
        let mut sessions: HashMap<String, Session> =
            serde_json::from_str(&data).map_err(|e| AuthError::Store(e.to_string()))?;
        Ok(sessions.remove(token))
    }
}

/// In-process session table.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, session: Session) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), session);
    }
}

impl SessionStore for MemorySessionStore {
    fn lookup(&self, token: &str) -> Result<Option<Session>, AuthError> {
        Ok(self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned())
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

fn same_v6_prefix(a: &Ipv6Addr, b: &Ipv6Addr) -> bool {
    a.segments()[..4] == b.segments()[..4]
}

/// Whether `actual` counts as the address a session was issued to.
///
/// Equal after unmapping IPv4-mapped IPv6, both loopback, or both IPv6 in
/// the same /64.
pub fn ip_matches(stored: &str, actual: IpAddr) -> bool {
    let Ok(stored) = stored.trim().parse::<IpAddr>() else {
        return false;
    };
    let (stored, actual) = (canonical(stored), canonical(actual));
    if stored == actual || (stored.is_loopback() && actual.is_loopback()) {
        return true;
    }
    match (stored, actual) {
        (IpAddr::V6(a), IpAddr::V6(b)) => same_v6_prefix(&a, &b),
        _ => false,
    }
}

#[derive(Clone)]
pub struct SessionValidator {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionValidator {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn validate(&self, token: &str, ip: IpAddr) -> Result<Session, AuthError> {
        self.validate_at(token, ip, now_millis())
    }

    fn validate_at(&self, token: &str, ip: IpAddr, now: i64) -> Result<Session, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let session = self.store.lookup(token)?.ok_or(AuthError::UnknownSession)?;
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        if session.created_at.saturating_add(ttl) <= now {
            debug!(created_at = session.created_at, "Session expired");
            return Err(AuthError::Expired);
        }
        if !ip_matches(&session.ip, ip) {
            debug!(stored = %session.ip, actual = %ip, "Session address mismatch");
            return Err(AuthError::IpMismatch);
        }
        Ok(session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ip_equivalence_rules() {
        assert!(ip_matches("203.0.113.7", ip("203.0.113.7")));
        assert!(!ip_matches("203.0.113.7", ip("203.0.113.8")));
        assert!(ip_matches("127.0.0.1", ip("::1")));
        assert!(ip_matches("::ffff:127.0.0.1", ip("127.0.0.1")));
        assert!(ip_matches("::ffff:203.0.113.7", ip("203.0.113.7")));
        assert!(ip_matches("2001:db8:1:2::10", ip("2001:db8:1:2:abcd::1")));
        assert!(!ip_matches("2001:db8:1:2::10", ip("2001:db8:1:3::10")));
        assert!(!ip_matches("garbage", ip("127.0.0.1")));
    }

    fn validator(sessions: &[(&str, Session)], ttl: Duration) -> SessionValidator {
        let store = MemorySessionStore::new();
        for (token, session) in sessions {
            store.insert(*token, session.clone());
        }
        SessionValidator::new(Arc::new(store), ttl)
    }

    #[test]
    fn validates_fresh_session_from_same_address() {
        let now = now_millis();
        let v = validator(
            &[("tok", Session { ip: "10.0.0.5".into(), created_at: now - 1000 })],
            Duration::from_secs(60),
        );
        assert!(v.validate_at("tok", ip("10.0.0.5"), now).is_ok());
        assert_eq!(
            v.validate_at("tok", ip("10.0.0.6"), now),
            Err(AuthError::IpMismatch)
        );
        assert_eq!(
            v.validate_at("nope", ip("10.0.0.5"), now),
            Err(AuthError::UnknownSession)
        );
        assert_eq!(
            v.validate_at("  ", ip("10.0.0.5"), now),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn expiry_is_checked_on_lookup() {
        let now = now_millis();
        let v = validator(
            &[("tok", Session { ip: "10.0.0.5".into(), created_at: now - 61_000 })],
            Duration::from_secs(60),
        );
        assert_eq!(v.validate_at("tok", ip("10.0.0.5"), now), Err(AuthError::Expired));
    }

    #[test]
    fn json_store_reads_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = JsonSessionStore::new(&path);
        assert_eq!(store.lookup("tok").unwrap(), None);

        std::fs::write(&path, r#"{"tok": {"ip": "::1", "createdAt": 42}}"#).unwrap();
        assert_eq!(
            store.lookup("tok").unwrap(),
            Some(Session { ip: "::1".into(), created_at: 42 })
        );

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(store.lookup("tok"), Err(AuthError::Store(_))));
    }
}
