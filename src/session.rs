//! Session store: signed opaque ids bound to a cookie or header, backed by
//! an in-memory data bag with TTL.
//!
//! A session id on the wire is `<raw>.<signature>` where the signature is a
//! base64url HMAC-SHA256 of the raw id under the configured secret. A session
//! is valid iff the signature verifies, the TTL has not lapsed, and (when
//! `strict`) the remote binding matches.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// The default session cookie / header name.
pub const SESSION_NAME: &str = "pode.sid";

/// Key of the authentication slot inside a session's data bag.
pub const AUTH_SLOT: &str = "Auth";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Secret the session signature is computed under.
    pub secret: String,
    /// Cookie or header name carrying the signed id.
    pub name: String,
    /// Idle lifetime: a session expires `duration` after its last use.
    pub duration: Duration,
    /// Reset `last_use` on every access.
    pub extend: bool,
    /// Bind sessions to `hash(remote address + user agent)`.
    pub strict: bool,
    /// Deliver the id in request/response headers instead of a cookie.
    pub use_headers: bool,
}

impl SessionConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            name: SESSION_NAME.to_string(),
            duration: Duration::from_secs(3600),
            extend: false,
            strict: false,
            use_headers: false,
        }
    }
}

/// One live session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub data: HashMap<String, Value>,
    pub created: DateTime<Utc>,
    pub last_use: DateTime<Utc>,
    pub duration: Duration,
    binding: Option<String>,
}

impl Session {
    fn new(duration: Duration, binding: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            data: HashMap::new(),
            created: now,
            last_use: now,
            duration,
            binding,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.duration) {
            Ok(d) => now - self.last_use > d,
            Err(_) => false,
        }
    }

    /// The cached authentication slot, when a method stored one.
    pub fn auth(&self) -> Option<&Value> {
        self.data.get(AUTH_SLOT)
    }

    pub fn set_auth(&mut self, auth: Value) {
        self.data.insert(AUTH_SLOT.to_string(), auth);
    }

    pub fn clear_auth(&mut self) {
        self.data.remove(AUTH_SLOT);
    }
}

/// Hash used for strict-session binding.
pub fn binding_hash(remote_address: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_address.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory session store. Guarded by the server-wide lockable.
#[derive(Debug)]
pub struct SessionStore {
    config: SessionConfig,
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn mac(&self, raw_id: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(raw_id.as_bytes());
        mac
    }

    /// Sign a raw session id for delivery.
    pub fn sign(&self, raw_id: &str) -> String {
        let tag = self.mac(raw_id).finalize().into_bytes();
        format!("{raw_id}.{}", URL_SAFE_NO_PAD.encode(tag))
    }

    /// Verify a signed id and return the raw id. Comparison is constant-time.
    pub fn verify(&self, signed: &str) -> Option<String> {
        let (raw_id, sig) = signed.rsplit_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;
        self.mac(raw_id).verify_slice(&sig).ok()?;
        Some(raw_id.to_string())
    }

    /// Allocate a new empty session. `binding` is the strict-mode hash of the
    /// caller's remote address and user agent; it is recorded even when
    /// strict mode is off so the flag can be enabled without a restart.
    pub fn create(&mut self, binding: Option<String>) -> &Session {
        let session = Session::new(self.config.duration, binding);
        let id = session.id.clone();
        tracing::debug!(session = %id, "session created");
        self.sessions.entry(id).or_insert(session)
    }

    /// Resolve a signed id to its live session.
    ///
    /// Returns `None` when the signature fails, the session is unknown or
    /// expired, or (in strict mode) the binding mismatches — in which case
    /// the session is revoked.
    pub fn resolve(&mut self, signed: &str, binding: Option<&str>) -> Option<&mut Session> {
        let raw_id = self.verify(signed)?;
        let now = Utc::now();

        let expired = match self.sessions.get(&raw_id) {
            None => return None,
            Some(s) => s.expired(now),
        };
        if expired {
            tracing::debug!(session = %raw_id, "session expired");
            self.sessions.remove(&raw_id);
            return None;
        }

        if self.config.strict {
            let matches = self
                .sessions
                .get(&raw_id)
                .map(|s| s.binding.as_deref() == binding)
                .unwrap_or(false);
            if !matches {
                tracing::warn!(session = %raw_id, "strict session binding mismatch, revoking");
                self.sessions.remove(&raw_id);
                return None;
            }
        }

        let extend = self.config.extend;
        let session = self.sessions.get_mut(&raw_id)?;
        if extend {
            session.last_use = now;
        }
        Some(session)
    }

    pub fn get(&self, raw_id: &str) -> Option<&Session> {
        self.sessions.get(raw_id)
    }

    pub fn get_mut(&mut self, raw_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(raw_id)
    }

    /// Remove a session outright.
    pub fn revoke(&mut self, raw_id: &str) -> bool {
        self.sessions.remove(raw_id).is_some()
    }

    /// Re-key a session under a fresh id, keeping its data. Used on login so
    /// an id handed out before authentication cannot be replayed after it.
    pub fn regenerate(&mut self, raw_id: &str) -> Option<String> {
        let mut session = self.sessions.remove(raw_id)?;
        session.id = uuid::Uuid::new_v4().simple().to_string();
        let new_id = session.id.clone();
        self.sessions.insert(new_id.clone(), session);
        Some(new_id)
    }

    /// Drop every expired session. Called from the housekeeping timer.
    pub fn purge_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.expired(now));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SessionStore {
        SessionStore::new(SessionConfig::new("test-secret"))
    }

    #[test]
    fn sign_verify_round_trip() {
        let store = store();
        let signed = store.sign("abc123");
        assert_eq!(store.verify(&signed), Some("abc123".to_string()));
    }

    #[test]
    fn tampered_signature_rejected() {
        let store = store();
        let mut signed = store.sign("abc123");
        signed.push('x');
        assert!(store.verify(&signed).is_none());

        let other = SessionStore::new(SessionConfig::new("other-secret"));
        assert!(other.verify(&store.sign("abc123")).is_none());
    }

    #[test]
    fn resolve_known_session() {
        let mut store = store();
        let id = store.create(None).id.clone();
        let signed = store.sign(&id);
        assert!(store.resolve(&signed, None).is_some());
    }

    #[test]
    fn expired_session_is_removed() {
        let mut store =
            SessionStore::new(SessionConfig::new("s"));
        let id = store.create(None).id.clone();
        store.get_mut(&id).unwrap().last_use = Utc::now() - chrono::Duration::hours(2);
        let signed = store.sign(&id);
        assert!(store.resolve(&signed, None).is_none());
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn strict_binding_mismatch_revokes() {
        let mut config = SessionConfig::new("s");
        config.strict = true;
        let mut store = SessionStore::new(config);

        let bind = binding_hash("10.0.0.1", "curl/8");
        let id = store.create(Some(bind.clone())).id.clone();
        let signed = store.sign(&id);

        let other = binding_hash("10.0.0.2", "curl/8");
        assert!(store.resolve(&signed, Some(&other)).is_none());
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn extend_resets_last_use() {
        let mut config = SessionConfig::new("s");
        config.extend = true;
        let mut store = SessionStore::new(config);

        let id = store.create(None).id.clone();
        let past = Utc::now() - chrono::Duration::minutes(30);
        store.get_mut(&id).unwrap().last_use = past;

        let signed = store.sign(&id);
        store.resolve(&signed, None).unwrap();
        assert!(store.get(&id).unwrap().last_use > past);
    }

    #[test]
    fn regenerate_keeps_data() {
        let mut store = store();
        let id = store.create(None).id.clone();
        store
            .get_mut(&id)
            .unwrap()
            .data
            .insert("cart".into(), json!(["socks"]));

        let new_id = store.regenerate(&id).unwrap();
        assert_ne!(new_id, id);
        assert!(store.get(&id).is_none());
        assert_eq!(store.get(&new_id).unwrap().data["cart"], json!(["socks"]));
    }

    #[test]
    fn auth_slot_helpers() {
        let mut store = store();
        let id = store.create(None).id.clone();
        let session = store.get_mut(&id).unwrap();
        session.set_auth(json!({"User": {"Name": "Morty"}, "IsAuthenticated": true}));
        assert!(session.auth().is_some());
        session.clear_auth();
        assert!(session.auth().is_none());
    }
}
