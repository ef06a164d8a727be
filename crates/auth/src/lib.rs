//! Single-user WebAuthn authentication and session management.
//!
//! - [`state`]: the immutable `AuthState` data model and its pure transitions.
//! - [`store`]: durable, cross-process-locked persistence for `AuthState`.
//! - [`service`]: the `AuthService` imperative shell tying state, storage,
//!   the WebAuthn verifier, challenge tracking, and lockout together.
//! - [`webauthn`]: the cryptographic verifier trait boundary and its
//!   `webauthn-rs`-backed implementation.
//! - [`challenge_store`] / [`lockout`] / [`token_hash`]: process-local
//!   supporting structures used by `AuthService`.

pub mod challenge_store;
pub mod error;
pub mod lockout;
pub mod service;
pub mod state;
pub mod store;
pub mod token_hash;
pub mod webauthn;

pub use error::{Error, Failure, Outcome, Reason, Result};
pub use service::{
    AuthEvent, AuthService, AuthenticationChallenge, IssuedSession, LoginResult, RegistrationChallenge,
    RegistrationResult, RequestContext, ServiceConfig, SetupTokenCreated, SetupTokenMetadata,
};
pub use state::{AuthState, Credential, CredentialMetadata, Session, SetupToken, User};
pub use store::StateStore;
pub use webauthn::{WebAuthnVerifier, WebauthnRsVerifier};
