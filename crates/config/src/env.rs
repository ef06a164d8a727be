//! Resolves the auth core's environment inputs into [`AuthEnvConfig`].

use std::path::PathBuf;

use tracing::warn;

/// Default session lifetime: 30 days.
pub const DEFAULT_SESSION_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
/// Default sliding-expiry refresh threshold: 24 hours.
pub const DEFAULT_SESSION_REFRESH_THRESHOLD_MS: i64 = 24 * 60 * 60 * 1000;
/// Default setup-token lifetime: 7 days.
pub const DEFAULT_SETUP_TOKEN_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;
/// Default WebAuthn challenge TTL: 60 seconds.
pub const DEFAULT_CHALLENGE_TTL_MS: i64 = 60_000;
/// Default number of failed attempts before a credential is locked out.
pub const DEFAULT_LOCKOUT_MAX_ATTEMPTS: u32 = 5;
/// Default lockout backoff floor: 30 seconds.
pub const DEFAULT_LOCKOUT_BASE_BACKOFF_MS: i64 = 30_000;
/// Default lockout backoff ceiling: 1 hour.
pub const DEFAULT_LOCKOUT_MAX_BACKOFF_MS: i64 = 60 * 60 * 1000;

/// Environment inputs consumed by the auth core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEnvConfig {
    pub data_dir: PathBuf,
    pub session_ttl_ms: i64,
    pub session_refresh_threshold_ms: i64,
    pub setup_token_ttl_ms: i64,
    pub challenge_ttl_ms: i64,
    pub lockout_max_attempts: u32,
    pub lockout_base_backoff_ms: i64,
    pub lockout_max_backoff_ms: i64,
}

impl Default for AuthEnvConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            session_refresh_threshold_ms: DEFAULT_SESSION_REFRESH_THRESHOLD_MS,
            setup_token_ttl_ms: DEFAULT_SETUP_TOKEN_TTL_MS,
            challenge_ttl_ms: DEFAULT_CHALLENGE_TTL_MS,
            lockout_max_attempts: DEFAULT_LOCKOUT_MAX_ATTEMPTS,
            lockout_base_backoff_ms: DEFAULT_LOCKOUT_BASE_BACKOFF_MS,
            lockout_max_backoff_ms: DEFAULT_LOCKOUT_MAX_BACKOFF_MS,
        }
    }
}

impl AuthEnvConfig {
    /// Resolve configuration from the process environment, falling back to
    /// built-in defaults for anything unset or unparsable. Malformed values
    /// are logged and ignored rather than treated as fatal.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env_path("DATA_DIR").unwrap_or(defaults.data_dir),
            session_ttl_ms: env_i64("SESSION_TTL_MS", defaults.session_ttl_ms),
            session_refresh_threshold_ms: env_i64(
                "SESSION_REFRESH_THRESHOLD_MS",
                defaults.session_refresh_threshold_ms,
            ),
            setup_token_ttl_ms: env_i64("SETUP_TOKEN_TTL_MS", defaults.setup_token_ttl_ms),
            challenge_ttl_ms: env_i64("CHALLENGE_TTL_MS", defaults.challenge_ttl_ms),
            lockout_max_attempts: env_u32(
                "LOCKOUT_MAX_ATTEMPTS",
                defaults.lockout_max_attempts,
            ),
            lockout_base_backoff_ms: env_i64(
                "LOCKOUT_BASE_BACKOFF_MS",
                defaults.lockout_base_backoff_ms,
            ),
            lockout_max_backoff_ms: env_i64(
                "LOCKOUT_MAX_BACKOFF_MS",
                defaults.lockout_max_backoff_ms,
            ),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "keyhold")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_i64(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(key, value = %raw, error = %e, "invalid env override, using default");
                default
            },
        },
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(key, value = %raw, error = %e, "invalid env override, using default");
                default
            },
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, unsafe_code)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let cfg = AuthEnvConfig::default();
        assert_eq!(cfg.session_ttl_ms, 30 * 24 * 60 * 60 * 1000);
        assert_eq!(cfg.session_refresh_threshold_ms, 24 * 60 * 60 * 1000);
        assert_eq!(cfg.setup_token_ttl_ms, 7 * 24 * 60 * 60 * 1000);
        assert_eq!(cfg.challenge_ttl_ms, 60_000);
        assert_eq!(cfg.lockout_base_backoff_ms, 30_000);
        assert_eq!(cfg.lockout_max_backoff_ms, 60 * 60 * 1000);
    }

    #[test]
    fn env_overrides_applied() {
        // SAFETY-free: test env vars are process-global, so exercise via a
        // fresh, unique key per test and clean up afterward.
        unsafe {
            std::env::set_var("SESSION_TTL_MS", "12345");
        }
        let cfg = AuthEnvConfig::from_env();
        assert_eq!(cfg.session_ttl_ms, 12345);
        unsafe {
            std::env::remove_var("SESSION_TTL_MS");
        }
    }

    #[test]
    fn malformed_override_falls_back_to_default() {
        unsafe {
            std::env::set_var("CHALLENGE_TTL_MS", "not-a-number");
        }
        let cfg = AuthEnvConfig::from_env();
        assert_eq!(cfg.challenge_ttl_ms, DEFAULT_CHALLENGE_TTL_MS);
        unsafe {
            std::env::remove_var("CHALLENGE_TTL_MS");
        }
    }

    #[test]
    fn data_dir_override() {
        unsafe {
            std::env::set_var("DATA_DIR", "/tmp/keyhold-test-data-dir");
        }
        let cfg = AuthEnvConfig::from_env();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/keyhold-test-data-dir"));
        unsafe {
            std::env::remove_var("DATA_DIR");
        }
    }
}
