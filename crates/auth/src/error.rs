//! Crate error type and the `Outcome` business-result sum type.
//!
//! Only two failure modes in this crate are signaled by throwing/propagating
//! a [`std::error::Error`]: [`Error::LastCredential`] (crosses multiple
//! layers cleanly as a dedicated kind) and [`Error::LockTimeout`]. Everything
//! else a caller-facing [`AuthService`](crate::service::AuthService)
//! operation can fail with is returned as an [`Outcome::Failure`] value.

use thiserror::Error;

/// Internal/infrastructure errors: I/O, JSON, and the two hard-throw kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Removing the last credential was attempted without `allowRemoveLast`.
    #[error("refusing to remove the last credential")]
    LastCredential,

    /// The cross-process state lock could not be acquired before the deadline.
    #[error("timed out waiting for the state lock")]
    LockTimeout,

    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable reason codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    InvalidSetupToken,
    InvalidChallenge,
    UnknownCredential,
    NotSetup,
    VerificationFailed,
    LastCredential,
    LockTimeout,
    CorruptState,
    TokenNameInvalid,
    TokenTooLong,
}

impl Reason {
    /// Default HTTP-ish status code for this reason. Callers may override
    /// (e.g. a wrong-PIN variant of `verification-failed` maps to 403
    /// instead of the default 400).
    pub fn default_status_code(self) -> u16 {
        match self {
            Reason::InvalidSetupToken => 403,
            Reason::InvalidChallenge => 400,
            Reason::UnknownCredential => 400,
            Reason::NotSetup => 400,
            Reason::VerificationFailed => 400,
            Reason::LastCredential => 403,
            Reason::LockTimeout => 503,
            Reason::CorruptState => 500,
            Reason::TokenNameInvalid => 400,
            Reason::TokenTooLong => 400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Reason::InvalidSetupToken => "invalid-setup-token",
            Reason::InvalidChallenge => "invalid-challenge",
            Reason::UnknownCredential => "unknown-credential",
            Reason::NotSetup => "not-setup",
            Reason::VerificationFailed => "verification-failed",
            Reason::LastCredential => "last-credential",
            Reason::LockTimeout => "lock-timeout",
            Reason::CorruptState => "corrupt-state",
            Reason::TokenNameInvalid => "token-name-invalid",
            Reason::TokenTooLong => "token-too-long",
        }
    }
}

/// A business-rule failure returned from an [`AuthService`](crate::service::AuthService)
/// operation (as opposed to an infrastructure [`Error`]).
#[derive(Debug, Clone)]
pub struct Failure {
    pub reason: Reason,
    pub message: String,
    pub status_code: u16,
    pub metadata: Option<serde_json::Value>,
}

impl Failure {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            status_code: reason.default_status_code(),
            metadata: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason.as_str())
    }
}

impl std::error::Error for Failure {}

/// Right-biased result monad used by [`AuthService`](crate::service::AuthService)
/// operations in place of exceptions for ordinary business failures.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T> Outcome<T> {
    pub fn success(value: T) -> Self {
        Self::Success(value)
    }

    pub fn failure(reason: Reason, message: impl Into<String>) -> Self {
        Self::Failure(Failure::new(reason, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(v) => Outcome::Success(f(v)),
            Self::Failure(e) => Outcome::Failure(e),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Success(v) => f(v),
            Self::Failure(e) => Outcome::Failure(e),
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Success(v) => v,
            Self::Failure(_) => default,
        }
    }

    /// Returns the success value. Panics if this is a `Failure`.
    pub fn unwrap(self) -> T {
        match self {
            Self::Success(v) => v,
            Self::Failure(e) => panic!("unwrap on Outcome::Failure: {e}"),
        }
    }

    pub fn as_result(self) -> std::result::Result<T, Failure> {
        match self {
            Self::Success(v) => Ok(v),
            Self::Failure(e) => Err(e),
        }
    }
}
