//! The data model and pure state transitions.
//!
//! `AuthState` is an immutable value object: every method that "mutates"
//! takes `&self` and returns a new `AuthState`. Nothing in this module
//! touches the filesystem, the clock, or a random source — timestamps and
//! tokens are supplied by the caller ([`crate::service::AuthService`]),
//! which keeps these transitions deterministic and cheap to test.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::token_hash::TokenHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub counter: u64,
    pub device_id: Option<String>,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub user_agent: Option<String>,
    pub setup_token_id: Option<String>,
}

/// Projection of [`Credential`] that deliberately drops `publicKey` and
/// `counter` before it ever reaches an outer layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    pub id: String,
    pub device_id: Option<String>,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub user_agent: Option<String>,
    pub setup_token_id: Option<String>,
}

impl From<&Credential> for CredentialMetadata {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id.clone(),
            device_id: c.device_id.clone(),
            name: c.name.clone(),
            created_at: c.created_at,
            last_used_at: c.last_used_at,
            user_agent: c.user_agent.clone(),
            setup_token_id: c.setup_token_id.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CredentialPatch {
    pub counter: Option<u64>,
    pub last_used_at: Option<i64>,
    pub name: Option<String>,
    pub device_id: Option<Option<String>>,
    pub user_agent: Option<Option<String>>,
    pub setup_token_id: Option<Option<String>>,
}

impl CredentialPatch {
    fn apply(self, c: &mut Credential) {
        if let Some(v) = self.counter {
            c.counter = v;
        }
        if let Some(v) = self.last_used_at {
            c.last_used_at = v;
        }
        if let Some(v) = self.name {
            c.name = v;
        }
        if let Some(v) = self.device_id {
            c.device_id = v;
        }
        if let Some(v) = self.user_agent {
            c.user_agent = v;
        }
        if let Some(v) = self.setup_token_id {
            c.setup_token_id = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub expiry: i64,
    pub credential_id: Option<String>,
    pub csrf_token: String,
    pub last_activity_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupToken {
    pub id: String,
    pub hash: String,
    pub salt: String,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub expires_at: i64,
    pub credential_id: Option<String>,
}

/// Plaintext input for [`AuthState::add_setup_token`]. The plaintext token
/// is hashed immediately and never stored.
pub struct NewSetupToken {
    pub id: String,
    pub token: String,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub expires_at: i64,
    pub credential_id: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SetupTokenPatch {
    pub name: Option<String>,
    pub last_used_at: Option<i64>,
    pub credential_id: Option<Option<String>>,
}

impl SetupTokenPatch {
    fn apply(self, t: &mut SetupToken) {
        if let Some(v) = self.name {
            t.name = v;
        }
        if let Some(v) = self.last_used_at {
            t.last_used_at = v;
        }
        if let Some(v) = self.credential_id {
            t.credential_id = v;
        }
    }
}

/// The full durable authentication state. Immutable: every transition
/// below returns a new `AuthState` rather than mutating `self`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub user: Option<User>,
    pub credentials: Vec<Credential>,
    pub sessions: HashMap<String, Session>,
    pub setup_tokens: Vec<SetupToken>,
}

impl AuthState {
    /// Fresh state, optionally pre-seeding a user id/name that the first
    /// registration ceremony will target. This is a transient in-memory
    /// shape only: `user` null iff `credentials` empty is asserted of
    /// persisted snapshots, not of this factory's output.
    pub fn empty(user_id: Option<String>, user_name: impl Into<String>) -> Self {
        Self {
            user: user_id.map(|id| User {
                id,
                name: user_name.into(),
            }),
            credentials: Vec::new(),
            sessions: HashMap::new(),
            setup_tokens: Vec::new(),
        }
    }

    // ---- credentials ----------------------------------------------------

    pub fn add_credential(&self, c: Credential) -> Self {
        let mut next = self.clone();
        next.credentials.push(c);
        next
    }

    pub fn update_credential(&self, id: &str, patch: CredentialPatch) -> Self {
        let mut next = self.clone();
        if let Some(c) = next.credentials.iter_mut().find(|c| c.id == id) {
            patch.apply(c);
        }
        next
    }

    /// Removes a credential, cascading to its sessions and setup tokens.
    /// Refuses to remove the last remaining credential unless
    /// `allow_remove_last` is set.
    pub fn remove_credential(
        &self,
        id: &str,
        allow_remove_last: bool,
    ) -> Result<Self, Error> {
        if self.credentials.len() <= 1 && self.credentials.iter().any(|c| c.id == id) && !allow_remove_last {
            return Err(Error::LastCredential);
        }

        let mut next = self.clone();
        next.credentials.retain(|c| c.id != id);
        next.sessions.retain(|_, s| s.credential_id.as_deref() != Some(id));
        next.setup_tokens
            .retain(|t| t.credential_id.as_deref() != Some(id));

        if next.credentials.is_empty() {
            next.user = None;
        }

        Ok(next)
    }

    pub fn get_credential(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }

    pub fn get_credentials_with_metadata(&self) -> Vec<CredentialMetadata> {
        self.credentials.iter().map(CredentialMetadata::from).collect()
    }

    // ---- sessions ---------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_session(
        &self,
        token: impl Into<String>,
        expiry: i64,
        credential_id: impl Into<String>,
        csrf_token: impl Into<String>,
        last_activity_at: i64,
    ) -> Self {
        let mut next = self.clone();
        next.sessions.insert(
            token.into(),
            Session {
                expiry,
                credential_id: Some(credential_id.into()),
                csrf_token: csrf_token.into(),
                last_activity_at,
            },
        );
        next
    }

    pub fn remove_session(&self, token: &str) -> Self {
        let mut next = self.clone();
        next.sessions.remove(token);
        next
    }

    pub fn revoke_all_sessions(&self) -> Self {
        let mut next = self.clone();
        next.sessions.clear();
        next
    }

    /// Drops sessions whose `expiry` has passed. Unlike [`Self::is_valid_session`],
    /// this does not also check that the bound credential still exists —
    /// orphaned sessions are already reclaimed by [`Self::remove_credential`].
    pub fn prune_expired_sessions(&self, now: i64) -> Self {
        let mut next = self.clone();
        next.sessions.retain(|_, s| s.expiry > now);
        next
    }

    /// Slides expiry forward when activity is stale enough to warrant it.
    /// `expiry` never decreases here.
    pub fn update_session_activity(
        &self,
        token: &str,
        now: i64,
        refresh_threshold_ms: i64,
        session_ttl_ms: i64,
    ) -> Self {
        let mut next = self.clone();
        if let Some(s) = next.sessions.get_mut(token) {
            let stale = now.saturating_sub(s.last_activity_at) > refresh_threshold_ms;
            s.last_activity_at = now;
            if stale {
                s.expiry = s.expiry.max(now + session_ttl_ms);
            }
        }
        next
    }

    pub fn get_session(&self, token: &str) -> Option<&Session> {
        self.sessions.get(token)
    }

    /// The security gate: true only if the token resolves to a session
    /// bound to a credential that currently exists, and is unexpired.
    pub fn is_valid_session(&self, token: &str, now: i64) -> bool {
        if token.is_empty() {
            return false;
        }
        let Some(session) = self.sessions.get(token) else {
            return false;
        };
        let Some(credential_id) = &session.credential_id else {
            return false;
        };
        now < session.expiry && self.get_credential(credential_id).is_some()
    }

    pub fn get_valid_sessions(&self, now: i64) -> Vec<(&String, &Session)> {
        self.sessions
            .iter()
            .filter(|(token, _)| self.is_valid_session(token, now))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ---- setup tokens -------------------------------------------------

    /// Hashes the plaintext token at the boundary; the plaintext itself is
    /// never stored in the returned state.
    pub fn add_setup_token(&self, new: NewSetupToken) -> Self {
        let TokenHash { salt_hex, hash_hex } = TokenHash::hash(&new.token);
        let mut next = self.clone();
        next.setup_tokens.push(SetupToken {
            id: new.id,
            hash: hash_hex,
            salt: salt_hex,
            name: new.name,
            created_at: new.created_at,
            last_used_at: new.last_used_at,
            expires_at: new.expires_at,
            credential_id: new.credential_id,
        });
        next
    }

    pub fn remove_setup_token(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.setup_tokens.retain(|t| t.id != id);
        next
    }

    pub fn update_setup_token(&self, id: &str, patch: SetupTokenPatch) -> Self {
        let mut next = self.clone();
        if let Some(t) = next.setup_tokens.iter_mut().find(|t| t.id == id) {
            patch.apply(t);
        }
        next
    }

    /// Iterates every setup token without short-circuiting on a match, so
    /// lookup latency does not reveal which (if any) token matched. The
    /// expiry check is applied only after the full scan (fail-closed).
    pub fn find_setup_token(&self, plaintext: &str, now: i64) -> Option<&SetupToken> {
        let mut matched: Option<&SetupToken> = None;
        for token in &self.setup_tokens {
            let ok = TokenHash::verify(plaintext, &token.salt, &token.hash);
            if ok && matched.is_none() {
                matched = Some(token);
            }
        }
        matched.filter(|t| t.expires_at > now)
    }

    pub fn prune_expired_tokens(&self, now: i64) -> Self {
        let mut next = self.clone();
        next.setup_tokens.retain(|t| t.expires_at > now);
        next
    }

    // ---- terminal ops ---------------------------------------------------

    /// Ends a session. If it was bound to a credential, this cascades like
    /// [`Self::remove_credential`]; an orphan or absent session is a no-op
    /// that returns `removed_credential_id = None`.
    pub fn end_session(
        &self,
        token: &str,
        allow_remove_last: bool,
    ) -> Result<(Self, Option<String>), Error> {
        let Some(session) = self.sessions.get(token) else {
            return Ok((self.clone(), None));
        };
        let Some(credential_id) = session.credential_id.clone() else {
            return Ok((self.remove_session(token), None));
        };

        let next = self.remove_credential(&credential_id, allow_remove_last)?;
        Ok((next, Some(credential_id)))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        BASE64.decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: &str) -> Credential {
        Credential {
            id: id.to_string(),
            public_key: vec![1, 2, 3],
            counter: 0,
            device_id: None,
            name: "Test Device".to_string(),
            created_at: 0,
            last_used_at: 0,
            user_agent: None,
            setup_token_id: None,
        }
    }

    #[test]
    fn remove_credential_refuses_last_without_flag() {
        let state = AuthState::empty(Some("u1".into()), "owner").add_credential(credential("c1"));
        let err = state.remove_credential("c1", false).unwrap_err();
        assert!(matches!(err, Error::LastCredential));
    }

    #[test]
    fn remove_last_credential_clears_user_and_sessions() {
        let state = AuthState::empty(Some("u1".into()), "owner")
            .add_credential(credential("c1"))
            .add_session("tok1", 1_000_000, "c1", "csrf1", 0);
        let state = state.remove_credential("c1", true).unwrap();
        assert!(state.credentials.is_empty());
        assert!(state.user.is_none());
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn remove_credential_cascades_setup_tokens() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_credential(credential("c2"))
            .add_setup_token(NewSetupToken {
                id: "t1".into(),
                token: "plain".into(),
                name: "token".into(),
                created_at: 0,
                last_used_at: 0,
                expires_at: 1_000_000,
                credential_id: Some("c1".into()),
            });
        let state = state.remove_credential("c1", false).unwrap();
        assert!(state.setup_tokens.is_empty());
        assert_eq!(state.credentials.len(), 1);
    }

    #[test]
    fn is_valid_session_requires_live_credential() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_session("tok1", 1_000_000, "c1", "csrf1", 0);
        assert!(state.is_valid_session("tok1", 500));

        let state = state.remove_credential("c1", true).unwrap();
        assert!(!state.is_valid_session("tok1", 500));
    }

    #[test]
    fn is_valid_session_rejects_expired() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_session("tok1", 100, "c1", "csrf1", 0);
        assert!(!state.is_valid_session("tok1", 200));
    }

    #[test]
    fn prune_expired_sessions_drops_only_past_expiry() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_session("expired", 100, "c1", "csrf1", 0)
            .add_session("live", 1_000_000, "c1", "csrf2", 0);
        let pruned = state.prune_expired_sessions(200);
        assert!(pruned.get_session("expired").is_none());
        assert!(pruned.get_session("live").is_some());
    }

    #[test]
    fn update_session_activity_slides_expiry_when_stale() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_session("tok1", 1_000_600_000, "c1", "csrf1", 0);
        let now = 26 * 60 * 60 * 1000i64;
        let refresh_threshold = 24 * 60 * 60 * 1000i64;
        let session_ttl = 30 * 24 * 60 * 60 * 1000i64;
        let updated = state.update_session_activity("tok1", now, refresh_threshold, session_ttl);
        let session = updated.get_session("tok1").unwrap();
        assert!(session.expiry >= now + session_ttl - 1000);
        assert_eq!(session.last_activity_at, now);
    }

    #[test]
    fn update_session_activity_does_not_decrease_expiry() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_session("tok1", 5_000_000_000, "c1", "csrf1", 0);
        let updated = state.update_session_activity("tok1", 1000, 24 * 60 * 60 * 1000, 30 * 24 * 60 * 60 * 1000);
        let session = updated.get_session("tok1").unwrap();
        assert!(session.expiry >= 5_000_000_000);
    }

    #[test]
    fn find_setup_token_scans_fully_and_checks_expiry() {
        let state = AuthState::empty(None, "owner")
            .add_setup_token(NewSetupToken {
                id: "t1".into(),
                token: "alpha".into(),
                name: "a".into(),
                created_at: 0,
                last_used_at: 0,
                expires_at: 100,
                credential_id: None,
            })
            .add_setup_token(NewSetupToken {
                id: "t2".into(),
                token: "beta".into(),
                name: "b".into(),
                created_at: 0,
                last_used_at: 0,
                expires_at: 1_000_000,
                credential_id: None,
            });

        assert!(state.find_setup_token("alpha", 50).is_some());
        // expired at now=200
        assert!(state.find_setup_token("alpha", 200).is_none());
        assert!(state.find_setup_token("beta", 200).is_some());
        assert!(state.find_setup_token("nonexistent", 50).is_none());
    }

    #[test]
    fn setup_token_plaintext_never_serialized() {
        let state = AuthState::empty(None, "owner").add_setup_token(NewSetupToken {
            id: "t1".into(),
            token: "super-secret-plaintext".into(),
            name: "a".into(),
            created_at: 0,
            last_used_at: 0,
            expires_at: 1_000_000,
            credential_id: None,
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("super-secret-plaintext"));
    }

    #[test]
    fn end_session_cascades_and_reports_removed_credential() {
        let state = AuthState::empty(None, "owner")
            .add_credential(credential("c1"))
            .add_credential(credential("c2"))
            .add_session("tok1", 1_000_000, "c1", "csrf1", 0);
        let (state, removed) = state.end_session("tok1", false).unwrap();
        assert_eq!(removed, Some("c1".to_string()));
        assert!(state.get_credential("c1").is_none());
    }

    #[test]
    fn end_session_on_orphan_token_is_noop() {
        let state = AuthState::empty(None, "owner").add_credential(credential("c1"));
        let (state, removed) = state.end_session("missing-token", false).unwrap();
        assert_eq!(removed, None);
        assert_eq!(state.credentials.len(), 1);
    }

    /// Best-effort timing check: `find_setup_token` scans every entry
    /// regardless of where (or whether) a match falls, so looking up a
    /// token that matches the first entry should cost roughly the same as
    /// one matching the last, or none at all. Coarse bucketing only — this
    /// is not a hard real-time guarantee, just a regression guard against
    /// reintroducing an early return on match.
    #[test]
    fn find_setup_token_timing_is_roughly_independent_of_match_position() {
        use std::time::Instant;

        let mut state = AuthState::empty(None, "owner");
        for i in 0..200 {
            state = state.add_setup_token(NewSetupToken {
                id: format!("t{i}"),
                token: format!("token-{i}"),
                name: "n".into(),
                created_at: 0,
                last_used_at: 0,
                expires_at: 1_000_000_000,
                credential_id: None,
            });
        }

        let timed = |plaintext: &str| -> u128 {
            let start = Instant::now();
            for _ in 0..20 {
                std::hint::black_box(state.find_setup_token(std::hint::black_box(plaintext), 0));
            }
            start.elapsed().as_micros()
        };

        let first = timed("token-0");
        let last = timed("token-199");
        let absent = timed("no-such-token");

        let slowest = first.max(last).max(absent).max(1);
        let fastest = first.min(last).min(absent).max(1);
        // Loose bound: position should not dominate cost. A short-circuiting
        // scan would make `first` an order of magnitude faster than `last`.
        assert!(
            slowest / fastest < 20,
            "timing spread too wide: first={first}us last={last}us absent={absent}us"
        );
    }
}
