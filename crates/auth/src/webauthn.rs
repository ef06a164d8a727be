//! The trait boundary to the WebAuthn cryptographic verifier and a real
//! `webauthn-rs`-backed implementation of it.
//!
//! Registration/authentication ceremony *state* (the library's
//! `PasskeyRegistration`/`PasskeyAuthentication`) is treated as an opaque
//! `serde_json::Value` on this boundary — it is serialized with
//! `webauthn-rs`'s `danger-allow-state-serialisation` feature and handed to
//! [`ChallengeStore`](crate::challenge_store::ChallengeStore) by the caller,
//! rather than kept in any long-lived map here. Relying-party name/id/origin
//! arrive per call from the HTTP boundary, so a fresh `Webauthn` instance is
//! built per call instead of owning one fixed at construction time.

use async_trait::async_trait;
use thiserror::Error;
use webauthn_rs::prelude::*;

#[derive(Debug, Error)]
pub enum WebAuthnError {
    #[error("failed to configure relying party: {0}")]
    Build(String),
    #[error("registration ceremony failed: {0}")]
    Registration(String),
    #[error("authentication ceremony failed: {0}")]
    Authentication(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RegistrationOptionsRequest {
    pub rp_name: String,
    pub rp_id: String,
    pub origin: Url,
    pub user_id: String,
    pub user_name: String,
    pub exclude_credential_ids: Vec<String>,
}

pub struct RegistrationOptions {
    /// The `PublicKeyCredentialCreationOptions` payload to hand to the
    /// browser, serialized.
    pub public_key: serde_json::Value,
    /// Opaque ceremony state to round-trip through the challenge store.
    pub state: serde_json::Value,
}

pub struct AuthenticationOptionsRequest {
    pub rp_id: String,
    pub origin: Url,
    /// Full stored credentials eligible for this login, not just ids —
    /// `webauthn-rs` needs the complete `Passkey` to build assertion
    /// options.
    pub allow_credentials: Vec<StoredCredential>,
}

pub struct AuthenticationOptions {
    pub public_key: serde_json::Value,
    pub state: serde_json::Value,
}

/// A previously registered credential, as the verifier needs to see it to
/// check a new assertion's signature and counter.
pub struct StoredCredential {
    pub id: String,
    /// The full `webauthn_rs::Passkey`, serialized. `AuthState` stores this
    /// verbatim in `Credential::public_key` as opaque bytes — this JSON
    /// document's UTF-8 bytes.
    pub passkey: serde_json::Value,
}

/// What a successful registration or authentication ceremony yields.
pub struct VerifiedCredential {
    pub id: String,
    pub public_key: Vec<u8>,
    pub counter: u64,
}

/// The cryptographic verifier boundary. Everything else in this crate
/// depends only on this trait, never on `webauthn-rs` directly.
#[async_trait]
pub trait WebAuthnVerifier: Send + Sync {
    async fn generate_registration_options(
        &self,
        req: RegistrationOptionsRequest,
    ) -> Result<RegistrationOptions, WebAuthnError>;

    async fn verify_registration(
        &self,
        state: serde_json::Value,
        response: serde_json::Value,
        expected_origin: Url,
        expected_rp_id: String,
    ) -> Result<VerifiedCredential, WebAuthnError>;

    async fn generate_authentication_options(
        &self,
        req: AuthenticationOptionsRequest,
    ) -> Result<AuthenticationOptions, WebAuthnError>;

    async fn verify_authentication(
        &self,
        state: serde_json::Value,
        response: serde_json::Value,
        stored_credential: StoredCredential,
        expected_origin: Url,
        expected_rp_id: String,
    ) -> Result<u64, WebAuthnError>;
}

fn build_webauthn(rp_id: &str, origin: &Url, rp_name: &str) -> Result<Webauthn, WebAuthnError> {
    WebauthnBuilder::new(rp_id, origin)
        .map_err(|e| WebAuthnError::Build(e.to_string()))?
        .rp_name(rp_name)
        .build()
        .map_err(|e| WebAuthnError::Build(e.to_string()))
}

/// Production verifier backed by `webauthn-rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebauthnRsVerifier;

#[async_trait]
impl WebAuthnVerifier for WebauthnRsVerifier {
    async fn generate_registration_options(
        &self,
        req: RegistrationOptionsRequest,
    ) -> Result<RegistrationOptions, WebAuthnError> {
        let webauthn = build_webauthn(&req.rp_id, &req.origin, &req.rp_name)?;
        let user_id = Uuid::parse_str(&req.user_id).unwrap_or_else(|_| Uuid::new_v4());

        let exclude = if req.exclude_credential_ids.is_empty() {
            None
        } else {
            Some(
                req.exclude_credential_ids
                    .iter()
                    .filter_map(|id| decode_credential_id(id))
                    .collect::<Vec<CredentialID>>(),
            )
        };

        let (ccr, reg_state) = webauthn
            .start_passkey_registration(user_id, &req.user_name, &req.user_name, exclude)
            .map_err(|e| WebAuthnError::Registration(e.to_string()))?;

        Ok(RegistrationOptions {
            public_key: serde_json::to_value(ccr)?,
            state: serde_json::to_value(reg_state)?,
        })
    }

    async fn verify_registration(
        &self,
        state: serde_json::Value,
        response: serde_json::Value,
        expected_origin: Url,
        expected_rp_id: String,
    ) -> Result<VerifiedCredential, WebAuthnError> {
        let webauthn = build_webauthn(&expected_rp_id, &expected_origin, &expected_rp_id)?;
        let reg_state: PasskeyRegistration = serde_json::from_value(state)?;
        let response: RegisterPublicKeyCredential = serde_json::from_value(response)?;

        let passkey = webauthn
            .finish_passkey_registration(&response, &reg_state)
            .map_err(|e| WebAuthnError::Registration(e.to_string()))?;

        Ok(VerifiedCredential {
            id: encode_credential_id(passkey.cred_id()),
            public_key: serde_json::to_vec(&passkey)?,
            counter: u64::from(passkey.counter()),
        })
    }

    async fn generate_authentication_options(
        &self,
        req: AuthenticationOptionsRequest,
    ) -> Result<AuthenticationOptions, WebAuthnError> {
        let webauthn = build_webauthn(&req.rp_id, &req.origin, &req.rp_id)?;
        let passkeys = req
            .allow_credentials
            .iter()
            .map(|c| serde_json::from_value::<Passkey>(c.passkey.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let (rcr, auth_state) = webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| WebAuthnError::Authentication(e.to_string()))?;

        Ok(AuthenticationOptions {
            public_key: serde_json::to_value(rcr)?,
            state: serde_json::to_value(auth_state)?,
        })
    }

    async fn verify_authentication(
        &self,
        state: serde_json::Value,
        response: serde_json::Value,
        stored_credential: StoredCredential,
        expected_origin: Url,
        expected_rp_id: String,
    ) -> Result<u64, WebAuthnError> {
        let webauthn = build_webauthn(&expected_rp_id, &expected_origin, &expected_rp_id)?;
        let auth_state: PasskeyAuthentication = serde_json::from_value(state)?;
        let response: PublicKeyCredential = serde_json::from_value(response)?;
        let _passkey: Passkey = serde_json::from_value(stored_credential.passkey)?;

        let result = webauthn
            .finish_passkey_authentication(&response, &auth_state)
            .map_err(|e| WebAuthnError::Authentication(e.to_string()))?;

        Ok(u64::from(result.counter()))
    }
}

fn encode_credential_id(id: &CredentialID) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(id.as_ref())
}

fn decode_credential_id(id: &str) -> Option<CredentialID> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(id)
        .ok()
        .map(CredentialID::from)
}

/// Deterministic, non-cryptographic verifier used by [`AuthService`](crate::service::AuthService)
/// tests and by downstream integration suites that want to exercise the
/// service layer without a real authenticator.
pub mod fake {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    pub struct FakeVerifier {
        next_counter: AtomicU64,
        /// When `false`, every verify call fails — used to exercise
        /// `verification-failed` paths.
        pub accept: std::sync::atomic::AtomicBool,
    }

    impl Default for FakeVerifier {
        fn default() -> Self {
            Self {
                next_counter: AtomicU64::new(1),
                accept: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl WebAuthnVerifier for FakeVerifier {
        async fn generate_registration_options(
            &self,
            req: RegistrationOptionsRequest,
        ) -> Result<RegistrationOptions, WebAuthnError> {
            Ok(RegistrationOptions {
                public_key: serde_json::json!({"userId": req.user_id}),
                state: serde_json::json!({"fake": "registration", "userId": req.user_id}),
            })
        }

        async fn verify_registration(
            &self,
            _state: serde_json::Value,
            response: serde_json::Value,
            _expected_origin: Url,
            _expected_rp_id: String,
        ) -> Result<VerifiedCredential, WebAuthnError> {
            if !self.accept.load(Ordering::SeqCst) {
                return Err(WebAuthnError::Registration("rejected by fake verifier".into()));
            }
            let id = response
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("fake-credential")
                .to_string();
            Ok(VerifiedCredential {
                id,
                public_key: b"fake-public-key".to_vec(),
                counter: 0,
            })
        }

        async fn generate_authentication_options(
            &self,
            req: AuthenticationOptionsRequest,
        ) -> Result<AuthenticationOptions, WebAuthnError> {
            let ids: Vec<String> = req.allow_credentials.iter().map(|c| c.id.clone()).collect();
            Ok(AuthenticationOptions {
                public_key: serde_json::json!({"allowCredentials": ids}),
                state: serde_json::json!({"fake": "authentication"}),
            })
        }

        async fn verify_authentication(
            &self,
            _state: serde_json::Value,
            _response: serde_json::Value,
            stored_credential: StoredCredential,
            _expected_origin: Url,
            _expected_rp_id: String,
        ) -> Result<u64, WebAuthnError> {
            if !self.accept.load(Ordering::SeqCst) {
                return Err(WebAuthnError::Authentication(
                    "rejected by fake verifier".into(),
                ));
            }
            let _ = stored_credential;
            Ok(self.next_counter.fetch_add(1, Ordering::SeqCst))
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::fake::FakeVerifier;
    use super::*;

    #[tokio::test]
    async fn fake_verifier_round_trips_registration() {
        let verifier = FakeVerifier::default();
        let options = verifier
            .generate_registration_options(RegistrationOptionsRequest {
                rp_name: "keyhold".into(),
                rp_id: "localhost".into(),
                origin: Url::parse("http://localhost:8080").unwrap(),
                user_id: "u1".into(),
                user_name: "owner".into(),
                exclude_credential_ids: vec![],
            })
            .await
            .unwrap();

        let verified = verifier
            .verify_registration(
                options.state,
                serde_json::json!({"id": "cred-1"}),
                Url::parse("http://localhost:8080").unwrap(),
                "localhost".into(),
            )
            .await
            .unwrap();
        assert_eq!(verified.id, "cred-1");
    }

    #[tokio::test]
    async fn fake_verifier_can_be_made_to_reject() {
        let verifier = FakeVerifier::default();
        verifier.accept.store(false, std::sync::atomic::Ordering::SeqCst);
        let result = verifier
            .verify_registration(
                serde_json::json!({}),
                serde_json::json!({"id": "cred-1"}),
                Url::parse("http://localhost:8080").unwrap(),
                "localhost".into(),
            )
            .await;
        assert!(result.is_err());
    }
}
