//! Per-credential exponential-backoff lockout tracking, process-local like
//! [`ChallengeStore`](crate::challenge_store::ChallengeStore).

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    fail_count: u32,
    locked_until: Option<Instant>,
}

/// Tracks failed verification attempts per credential id and enforces an
/// exponential backoff once `max_attempts` is reached.
pub struct CredentialLockout {
    entries: DashMap<String, Entry>,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl CredentialLockout {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    /// Returns `Some(remaining)` if the credential is currently locked out.
    pub fn is_locked(&self, credential_id: &str) -> Option<Duration> {
        let entry = self.entries.get(credential_id)?;
        let locked_until = entry.locked_until?;
        let now = Instant::now();
        if locked_until > now {
            Some(locked_until - now)
        } else {
            None
        }
    }

    /// Records a failed verification attempt, locking the credential out
    /// once `max_attempts` is reached. Backoff doubles on each subsequent
    /// failure while still locked, capped at `max_backoff`.
    pub fn record_failure(&self, credential_id: &str) {
        let mut entry = self
            .entries
            .entry(credential_id.to_string())
            .or_insert_with(|| Entry {
                fail_count: 0,
                locked_until: None,
            });
        entry.fail_count = entry.fail_count.saturating_add(1);
        if entry.fail_count >= self.max_attempts {
            let backoff_exp = entry.fail_count - self.max_attempts;
            let backoff = self
                .base_backoff
                .saturating_mul(1 << backoff_exp.min(16))
                .min(self.max_backoff);
            entry.locked_until = Some(Instant::now() + backoff);
        }
    }

    /// Clears all failure state for a credential, e.g. after a successful
    /// verification.
    pub fn record_success(&self, credential_id: &str) {
        self.entries.remove(credential_id);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn lockout() -> CredentialLockout {
        CredentialLockout::new(3, Duration::from_millis(10), Duration::from_secs(1))
    }

    #[test]
    fn unlocked_below_threshold() {
        let l = lockout();
        l.record_failure("cred-1");
        l.record_failure("cred-1");
        assert!(l.is_locked("cred-1").is_none());
    }

    #[test]
    fn locks_at_threshold() {
        let l = lockout();
        for _ in 0..3 {
            l.record_failure("cred-1");
        }
        assert!(l.is_locked("cred-1").is_some());
    }

    #[test]
    fn success_clears_lockout() {
        let l = lockout();
        for _ in 0..3 {
            l.record_failure("cred-1");
        }
        assert!(l.is_locked("cred-1").is_some());
        l.record_success("cred-1");
        assert!(l.is_locked("cred-1").is_none());
    }

    #[test]
    fn backoff_escalates_and_caps() {
        let l = CredentialLockout::new(1, Duration::from_secs(1), Duration::from_secs(3));
        l.record_failure("cred-1");
        let first = l.is_locked("cred-1").unwrap();
        // Force re-evaluation as if the first window had elapsed by
        // recording another failure; backoff exponent advances regardless.
        l.record_failure("cred-1");
        let second = l.is_locked("cred-1").unwrap();
        assert!(second >= first);
    }
}
