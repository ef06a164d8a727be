//! Process-local store for in-flight WebAuthn challenges.
//!
//! Challenges are single-use and short-lived; they never touch durable
//! state, so a `DashMap` (as used elsewhere in this crate for lockout
//! tracking) is sufficient — no cross-process coordination is needed.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    value: serde_json::Value,
    meta: Option<serde_json::Value>,
    expires_at: Instant,
}

/// Tracks outstanding registration/authentication challenges keyed by an
/// opaque challenge id, enforcing single-use consumption and a TTL.
pub struct ChallengeStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Records a new challenge, along with optional metadata (e.g. the
    /// setup-token id a registration ceremony is bound to).
    pub fn store(&self, id: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(
            id.into(),
            Entry {
                value,
                meta: None,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn set_meta(&self, id: &str, meta: serde_json::Value) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.meta = Some(meta);
        }
    }

    pub fn get_meta(&self, id: &str) -> Option<serde_json::Value> {
        self.entries.get(id).and_then(|e| e.meta.clone())
    }

    pub fn delete_meta(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.meta = None;
        }
    }

    /// Atomically removes and returns the challenge if present and unexpired.
    /// A challenge can be consumed at most once.
    pub fn consume(&self, id: &str) -> Option<serde_json::Value> {
        self.sweep_opportunistic();
        let (_, entry) = self.entries.remove(id)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Drops every expired entry. Called opportunistically on `consume` so a
    /// store that is actively used still bounds its memory between periodic
    /// sweeps.
    fn sweep_opportunistic(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at >= now);
    }

    /// Drops all expired entries. Intended to be called periodically by the
    /// owning service.
    pub fn sweep(&self) {
        self.sweep_opportunistic();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn consume_is_single_use() {
        let store = ChallengeStore::new(Duration::from_secs(60));
        store.store("c1", json!({"foo": "bar"}));
        assert!(store.consume("c1").is_some());
        assert!(store.consume("c1").is_none());
    }

    #[test]
    fn expired_challenge_is_not_consumable() {
        let store = ChallengeStore::new(Duration::from_millis(1));
        store.store("c1", json!({}));
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.consume("c1").is_none());
    }

    #[test]
    fn meta_round_trips_until_deleted() {
        let store = ChallengeStore::new(Duration::from_secs(60));
        store.store("c1", json!({}));
        store.set_meta("c1", json!({"setupTokenId": "abc"}));
        assert_eq!(store.get_meta("c1"), Some(json!({"setupTokenId": "abc"})));
        store.delete_meta("c1");
        assert_eq!(store.get_meta("c1"), None);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let store = ChallengeStore::new(Duration::from_millis(1));
        store.store("c1", json!({}));
        std::thread::sleep(Duration::from_millis(10));
        store.sweep();
        assert!(store.is_empty());
    }
}
