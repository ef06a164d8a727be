//! The imperative shell: thin transactional wrappers around [`AuthState`]
//! and [`StateStore`], each running under [`StateStore::with_state_lock`]
//! and returning an [`Outcome`].

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::broadcast;
use webauthn_rs::prelude::Url;

use crate::challenge_store::ChallengeStore;
use crate::error::{Error, Failure, Outcome, Reason};
use crate::lockout::CredentialLockout;
use crate::state::{
    AuthState, Credential, CredentialMetadata, CredentialPatch, NewSetupToken, SetupTokenPatch, User,
};
use crate::store::{ModifierOutcome, StateStore};
use crate::webauthn::{
    AuthenticationOptionsRequest, RegistrationOptionsRequest, StoredCredential, WebAuthnVerifier,
};

/// Timings and limits an `AuthService` needs that don't belong on
/// `AuthState` itself — the HTTP boundary owns loading these from
/// `keyhold-config`.
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub session_ttl_ms: i64,
    pub session_refresh_threshold_ms: i64,
    pub challenge_ttl_ms: i64,
    pub setup_token_ttl_ms: i64,
    pub lockout_max_attempts: u32,
    pub lockout_base_backoff_ms: i64,
    pub lockout_max_backoff_ms: i64,
}

/// Broadcast to the outer system so it can close stale WebSocket/PTY
/// connections tied to a credential or session. The HTTP/PTY boundary owns
/// what it does with these; this crate only emits them.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    CredentialRegistered { credential_id: String },
    CredentialRemoved { credential_id: String },
    SessionsRevoked,
}

pub struct IssuedSession {
    pub token: String,
    pub csrf_token: String,
    pub expiry: i64,
}

pub struct RegistrationChallenge {
    pub challenge_id: String,
    pub public_key: serde_json::Value,
}

pub struct RegistrationResult {
    pub session: IssuedSession,
    pub updated_state: AuthState,
    pub credential_id: String,
}

pub struct AuthenticationChallenge {
    pub challenge_id: String,
    pub public_key: serde_json::Value,
}

pub struct LoginResult {
    pub session: IssuedSession,
    pub updated_state: AuthState,
}

pub struct SetupTokenCreated {
    pub id: String,
    pub token: String,
    pub expires_at: i64,
}

pub struct SetupTokenMetadata {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub expires_at: i64,
    pub credential_id: Option<String>,
}

/// Per-request inputs the HTTP boundary supplies: relying-party identity,
/// the calling origin, and whether the request arrived over loopback.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub origin: Url,
    pub rp_id: String,
    pub rp_name: String,
    pub is_local_request: bool,
}

pub struct AuthService {
    store: StateStore,
    challenges: Arc<ChallengeStore>,
    lockout: CredentialLockout,
    verifier: Box<dyn WebAuthnVerifier>,
    config: ServiceConfig,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthService {
    pub fn new(store: StateStore, verifier: Box<dyn WebAuthnVerifier>, config: ServiceConfig) -> Self {
        let challenge_ttl = Duration::from_millis(config.challenge_ttl_ms.max(0) as u64);
        let challenges = Arc::new(ChallengeStore::new(challenge_ttl));
        let lockout = CredentialLockout::new(
            config.lockout_max_attempts,
            std::time::Duration::from_millis(config.lockout_base_backoff_ms.max(0) as u64),
            std::time::Duration::from_millis(config.lockout_max_backoff_ms.max(0) as u64),
        );
        let (events, _) = broadcast::channel(32);

        // Two-layer sweep: `consume` reclaims opportunistically, this
        // periodic pass catches challenges whose ceremony is abandoned
        // before `consume` is ever called (a cancelled or timed-out browser
        // prompt).
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweeper = challenges.clone();
            handle.spawn(async move {
                let mut interval = tokio::time::interval(challenge_ttl.max(Duration::from_millis(1)));
                loop {
                    interval.tick().await;
                    sweeper.sweep();
                }
            });
        } else {
            tracing::warn!("no tokio runtime at AuthService construction, periodic challenge sweep disabled");
        }

        Self {
            store,
            challenges,
            lockout,
            verifier,
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    // ---- registration -----------------------------------------------------

    pub async fn generate_registration_options(
        &self,
        ctx: &RequestContext,
        setup_token: Option<&str>,
    ) -> Outcome<RegistrationChallenge> {
        let now = crate::store::now_ms();
        let setup_token_owned = setup_token.map(str::to_string);

        type Probe = Outcome<(String, String, Vec<String>)>;

        let probe: Result<Probe, Error> = self
            .store
            .with_state_lock(move |state| {
                let setup_token = setup_token_owned.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));

                    if state.has_credentials() {
                        let Some(token) = &setup_token else {
                            return Ok(ModifierOutcome::read_only(Outcome::Failure(Failure::new(
                                Reason::InvalidSetupToken,
                                "a setup token is required to add another credential",
                            ))));
                        };
                        if state.find_setup_token(token, now).is_none() {
                            return Ok(ModifierOutcome::read_only(Outcome::Failure(Failure::new(
                                Reason::InvalidSetupToken,
                                "setup token is unknown or expired",
                            ))));
                        }
                    }

                    let user_id = state
                        .user
                        .as_ref()
                        .map(|u| u.id.clone())
                        .unwrap_or_else(random_user_id);
                    let user_name = state
                        .user
                        .as_ref()
                        .map(|u| u.name.clone())
                        .unwrap_or_else(|| "owner".to_string());
                    let exclude_credential_ids =
                        state.credentials.iter().map(|c| c.id.clone()).collect();

                    Ok(ModifierOutcome::read_only(Outcome::Success((
                        user_id,
                        user_name,
                        exclude_credential_ids,
                    ))))
                }
            })
            .await;

        let (user_id, user_name, exclude_credential_ids) = match probe {
            Ok(Outcome::Success(v)) => v,
            Ok(Outcome::Failure(f)) => return Outcome::Failure(f),
            Err(e) => return Outcome::Failure(infra_failure(e)),
        };

        let options = match self
            .verifier
            .generate_registration_options(RegistrationOptionsRequest {
                rp_name: ctx.rp_name.clone(),
                rp_id: ctx.rp_id.clone(),
                origin: ctx.origin.clone(),
                user_id,
                user_name,
                exclude_credential_ids,
            })
            .await
        {
            Ok(o) => o,
            Err(e) => return Outcome::Failure(Failure::new(Reason::VerificationFailed, e.to_string())),
        };

        let challenge_id = uuid::Uuid::new_v4().to_string();
        self.challenges.store(&challenge_id, options.state);
        if let Some(token) = setup_token {
            self.challenges
                .set_meta(&challenge_id, serde_json::json!({"setupToken": token}));
        }

        Outcome::Success(RegistrationChallenge {
            challenge_id,
            public_key: options.public_key,
        })
    }

    pub async fn verify_registration(
        &self,
        ctx: &RequestContext,
        challenge_id: &str,
        response: serde_json::Value,
        device_name: Option<String>,
        user_agent: Option<String>,
    ) -> Outcome<RegistrationResult> {
        let Some(ceremony_state) = self.challenges.consume(challenge_id) else {
            return Outcome::Failure(Failure::new(Reason::InvalidChallenge, "challenge expired or unknown"));
        };
        let setup_token = self
            .challenges
            .get_meta(challenge_id)
            .and_then(|m| m.get("setupToken").and_then(|v| v.as_str()).map(str::to_string));

        let verified = match self
            .verifier
            .verify_registration(ceremony_state, response, ctx.origin.clone(), ctx.rp_id.clone())
            .await
        {
            Ok(v) => v,
            Err(e) => return Outcome::Failure(Failure::new(Reason::VerificationFailed, e.to_string())),
        };

        let device_name = device_name.unwrap_or_else(|| "Unknown Device".to_string());
        let session_ttl_ms = self.config.session_ttl_ms;

        let result: Result<Outcome<RegistrationResult>, Error> = self
            .store
            .with_state_lock(move |state| {
                let setup_token = setup_token.clone();
                let device_name = device_name.clone();
                let user_agent = user_agent.clone();
                let verified_id = verified.id.clone();
                let public_key = verified.public_key.clone();
                let counter = verified.counter;
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let now = crate::store::now_ms();

                    // Re-validate the setup token under the lock, closing the
                    // TOCTOU gap between options and verify.
                    let setup_token_id = if state.has_credentials() {
                        let Some(token) = &setup_token else {
                            return Ok(ModifierOutcome::read_only(Outcome::Failure(Failure::new(
                                Reason::InvalidSetupToken,
                                "setup token is required",
                            ))));
                        };
                        let Some(entry) = state.find_setup_token(token, now) else {
                            return Ok(ModifierOutcome::read_only(Outcome::Failure(Failure::new(
                                Reason::InvalidSetupToken,
                                "setup token is unknown or expired",
                            ))));
                        };
                        Some(entry.id.clone())
                    } else {
                        None
                    };

                    let credential = Credential {
                        id: verified_id.clone(),
                        public_key,
                        counter,
                        device_id: None,
                        name: device_name,
                        created_at: now,
                        last_used_at: now,
                        user_agent,
                        setup_token_id: setup_token_id.clone(),
                    };

                    let mut next = state.add_credential(credential);
                    if next.user.is_none() {
                        next.user = Some(User {
                            id: random_user_id(),
                            name: "owner".to_string(),
                        });
                    }
                    if let Some(token_id) = &setup_token_id {
                        next = next.update_setup_token(
                            token_id,
                            SetupTokenPatch {
                                last_used_at: Some(now),
                                credential_id: Some(Some(verified_id.clone())),
                                ..Default::default()
                            },
                        );
                    }

                    let token = to_hex(&random_bytes::<32>());
                    let csrf_token = to_hex(&random_bytes::<32>());
                    let expiry = now + session_ttl_ms;
                    let next = next.add_session(&token, expiry, verified_id.clone(), &csrf_token, now);

                    let result = RegistrationResult {
                        session: IssuedSession { token, csrf_token, expiry },
                        updated_state: next.clone(),
                        credential_id: verified_id,
                    };
                    Ok(ModifierOutcome::save(next, Outcome::Success(result)))
                }
            })
            .await;

        match result {
            Ok(outcome) => {
                if let Outcome::Success(r) = &outcome {
                    self.emit(AuthEvent::CredentialRegistered {
                        credential_id: r.credential_id.clone(),
                    });
                }
                outcome
            },
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    // ---- login --------------------------------------------------------------

    pub async fn generate_login_options(&self, ctx: &RequestContext) -> Outcome<AuthenticationChallenge> {
        let credentials: Result<Vec<Credential>, Error> = self
            .store
            .with_state_lock(|state| async move {
                let creds = state.map(|s| s.credentials).unwrap_or_default();
                Ok(ModifierOutcome::read_only(creds))
            })
            .await;
        let credentials = match credentials {
            Ok(c) => c,
            Err(e) => return Outcome::Failure(infra_failure(e)),
        };

        if credentials.is_empty() {
            return Outcome::Failure(Failure::new(Reason::NotSetup, "no credentials registered yet"));
        }

        let allow_credentials: Vec<StoredCredential> = match credentials
            .iter()
            .map(credential_to_stored)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(v) => v,
            Err(e) => return Outcome::Failure(Failure::new(Reason::CorruptState, e.to_string())),
        };

        let options = match self
            .verifier
            .generate_authentication_options(AuthenticationOptionsRequest {
                rp_id: ctx.rp_id.clone(),
                origin: ctx.origin.clone(),
                allow_credentials,
            })
            .await
        {
            Ok(o) => o,
            Err(e) => return Outcome::Failure(Failure::new(Reason::VerificationFailed, e.to_string())),
        };

        let challenge_id = uuid::Uuid::new_v4().to_string();
        self.challenges.store(&challenge_id, options.state);

        Outcome::Success(AuthenticationChallenge {
            challenge_id,
            public_key: options.public_key,
        })
    }

    pub async fn verify_login(
        &self,
        ctx: &RequestContext,
        challenge_id: &str,
        credential_id: &str,
        response: serde_json::Value,
    ) -> Outcome<LoginResult> {
        // Unknown-credential check happens before the challenge is
        // consumed — this ordering is observable and specified.
        let lookup: Result<Option<Credential>, Error> = self
            .store
            .with_state_lock({
                let credential_id = credential_id.to_string();
                move |state| {
                    let credential_id = credential_id.clone();
                    async move {
                        let cred = state.as_ref().and_then(|s| s.get_credential(&credential_id)).cloned();
                        Ok(ModifierOutcome::read_only(cred))
                    }
                }
            })
            .await;

        let credential = match lookup {
            Ok(Some(c)) => c,
            Ok(None) => {
                return Outcome::Failure(Failure::new(Reason::UnknownCredential, "no such credential"));
            },
            Err(e) => return Outcome::Failure(infra_failure(e)),
        };

        if let Some(remaining) = self.lockout.is_locked(credential_id) {
            return Outcome::Failure(
                Failure::new(Reason::VerificationFailed, "credential is temporarily locked out")
                    .with_metadata(serde_json::json!({"retryAfterMs": remaining.as_millis() as u64})),
            );
        }

        let Some(ceremony_state) = self.challenges.consume(challenge_id) else {
            return Outcome::Failure(Failure::new(Reason::InvalidChallenge, "challenge expired or unknown"));
        };

        let stored_credential = match credential_to_stored(&credential) {
            Ok(c) => c,
            Err(e) => return Outcome::Failure(Failure::new(Reason::CorruptState, e.to_string())),
        };

        let new_counter = match self
            .verifier
            .verify_authentication(
                ceremony_state,
                response,
                stored_credential,
                ctx.origin.clone(),
                ctx.rp_id.clone(),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.lockout.record_failure(credential_id);
                return Outcome::Failure(Failure::new(Reason::VerificationFailed, e.to_string()));
            },
        };

        self.lockout.record_success(credential_id);

        let credential_id = credential_id.to_string();
        let session_ttl_ms = self.config.session_ttl_ms;
        let result: Result<Outcome<LoginResult>, Error> = self
            .store
            .with_state_lock(move |state| {
                let credential_id = credential_id.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let now = crate::store::now_ms();

                    let state = state.prune_expired_sessions(now);
                    let state = state.update_credential(
                        &credential_id,
                        CredentialPatch {
                            counter: Some(new_counter),
                            last_used_at: Some(now),
                            ..Default::default()
                        },
                    );

                    let token = to_hex(&random_bytes::<32>());
                    let csrf_token = to_hex(&random_bytes::<32>());
                    let expiry = now + session_ttl_ms;
                    let state = state.add_session(&token, expiry, credential_id.clone(), &csrf_token, now);

                    let result = LoginResult {
                        session: IssuedSession { token, csrf_token, expiry },
                        updated_state: state.clone(),
                    };
                    Ok(ModifierOutcome::save(state, Outcome::Success(result)))
                }
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    // ---- sessions -----------------------------------------------------------

    pub async fn logout(&self, ctx: &RequestContext, session_token: &str) -> Outcome<()> {
        let session_token = session_token.to_string();
        let allow_remove_last = ctx.is_local_request;
        let result: Result<(Outcome<()>, Option<String>), Error> = self
            .store
            .with_state_lock(move |state| {
                let session_token = session_token.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let (next, removed) = state.end_session(&session_token, allow_remove_last)?;
                    Ok(ModifierOutcome::save(next, (Outcome::Success(()), removed)))
                }
            })
            .await;

        match result {
            Ok((outcome, removed)) => {
                if let Some(credential_id) = removed {
                    self.emit(AuthEvent::CredentialRemoved { credential_id });
                }
                outcome
            },
            Err(Error::LastCredential) => {
                Outcome::Failure(Failure::new(Reason::LastCredential, "refusing to remove the last credential"))
            },
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn revoke_all(&self) -> Outcome<()> {
        let result = self
            .store
            .with_state_lock(|state| async move {
                let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                let next = state.revoke_all_sessions();
                Ok(ModifierOutcome::save(next, Outcome::Success(())))
            })
            .await;

        match result {
            Ok(outcome) => {
                self.emit(AuthEvent::SessionsRevoked);
                outcome
            },
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    /// Silently a no-op if `session_token` does not resolve to a valid
    /// session — callers refresh opportunistically on every authenticated
    /// request and should never see this fail.
    pub async fn refresh_session_activity(&self, session_token: &str) -> Outcome<()> {
        let session_token = session_token.to_string();
        let refresh_threshold_ms = self.config.session_refresh_threshold_ms;
        let session_ttl_ms = self.config.session_ttl_ms;

        let result = self
            .store
            .with_state_lock(move |state| {
                let session_token = session_token.clone();
                async move {
                    let Some(state) = state else {
                        return Ok(ModifierOutcome::read_only(()));
                    };
                    let now = crate::store::now_ms();
                    if !state.is_valid_session(&session_token, now) {
                        return Ok(ModifierOutcome::read_only(()));
                    }
                    let next =
                        state.update_session_activity(&session_token, now, refresh_threshold_ms, session_ttl_ms);
                    Ok(ModifierOutcome::save(next, ()))
                }
            })
            .await;

        match result {
            Ok(()) => Outcome::Success(()),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    // ---- credential CRUD ------------------------------------------------------

    pub async fn list_credentials(&self) -> Outcome<Vec<CredentialMetadata>> {
        let result = self
            .store
            .with_state_lock(|state| async move {
                let metadata = state.map(|s| s.get_credentials_with_metadata()).unwrap_or_default();
                Ok(ModifierOutcome::read_only(metadata))
            })
            .await;
        match result {
            Ok(m) => Outcome::Success(m),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn rename_credential(&self, id: &str, name: &str) -> Outcome<()> {
        if name.is_empty() || name.len() > 128 {
            return Outcome::Failure(Failure::new(Reason::TokenNameInvalid, "invalid device name"));
        }
        let id = id.to_string();
        let name = name.to_string();
        let result = self
            .store
            .with_state_lock(move |state| {
                let id = id.clone();
                let name = name.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let next = state.update_credential(
                        &id,
                        CredentialPatch {
                            name: Some(name),
                            ..Default::default()
                        },
                    );
                    Ok(ModifierOutcome::save(next, ()))
                }
            })
            .await;
        match result {
            Ok(()) => Outcome::Success(()),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn delete_credential(&self, ctx: &RequestContext, id: &str) -> Outcome<()> {
        let id = id.to_string();
        let allow_remove_last = ctx.is_local_request;
        let result = self
            .store
            .with_state_lock(move |state| {
                let id = id.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let next = state.remove_credential(&id, allow_remove_last)?;
                    Ok(ModifierOutcome::save(next, ()))
                }
            })
            .await;
        match result {
            Ok(()) => Outcome::Success(()),
            Err(Error::LastCredential) => {
                Outcome::Failure(Failure::new(Reason::LastCredential, "refusing to remove the last credential"))
            },
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    // ---- setup-token CRUD -------------------------------------------------

    pub async fn create_setup_token(&self, name: &str) -> Outcome<SetupTokenCreated> {
        if name.is_empty() || name.len() > 128 {
            return Outcome::Failure(Failure::new(Reason::TokenNameInvalid, "invalid token name"));
        }
        let name = name.to_string();
        let now = crate::store::now_ms();
        let expires_at = now + self.config.setup_token_ttl_ms;
        let id = to_hex(&random_bytes::<8>());
        let token = to_hex(&random_bytes::<16>());

        let result = self
            .store
            .with_state_lock({
                let id = id.clone();
                let token = token.clone();
                move |state| {
                    let id = id.clone();
                    let token = token.clone();
                    let name = name.clone();
                    async move {
                        let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                        let next = state.add_setup_token(NewSetupToken {
                            id,
                            token,
                            name,
                            created_at: now,
                            last_used_at: now,
                            expires_at,
                            credential_id: None,
                        });
                        Ok(ModifierOutcome::save(next, ()))
                    }
                }
            })
            .await;

        match result {
            Ok(()) => Outcome::Success(SetupTokenCreated { id, token, expires_at }),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn list_setup_tokens(&self) -> Outcome<Vec<SetupTokenMetadata>> {
        let result = self
            .store
            .with_state_lock(|state| async move {
                let tokens = state
                    .map(|s| {
                        s.setup_tokens
                            .iter()
                            .map(|t| SetupTokenMetadata {
                                id: t.id.clone(),
                                name: t.name.clone(),
                                created_at: t.created_at,
                                last_used_at: t.last_used_at,
                                expires_at: t.expires_at,
                                credential_id: t.credential_id.clone(),
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                Ok(ModifierOutcome::read_only(tokens))
            })
            .await;
        match result {
            Ok(t) => Outcome::Success(t),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn rename_setup_token(&self, id: &str, name: &str) -> Outcome<()> {
        if name.is_empty() || name.len() > 128 {
            return Outcome::Failure(Failure::new(Reason::TokenNameInvalid, "invalid token name"));
        }
        let id = id.to_string();
        let name = name.to_string();
        let result = self
            .store
            .with_state_lock(move |state| {
                let id = id.clone();
                let name = name.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let next = state.update_setup_token(
                        &id,
                        SetupTokenPatch {
                            name: Some(name),
                            ..Default::default()
                        },
                    );
                    Ok(ModifierOutcome::save(next, ()))
                }
            })
            .await;
        match result {
            Ok(()) => Outcome::Success(()),
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }

    pub async fn revoke_setup_token(&self, ctx: &RequestContext, id: &str) -> Outcome<()> {
        let id = id.to_string();
        let allow_remove_last = ctx.is_local_request;
        let result = self
            .store
            .with_state_lock(move |state| {
                let id = id.clone();
                async move {
                    let state = state.unwrap_or_else(|| AuthState::empty(None, "owner"));
                    let linked_credential =
                        state.setup_tokens.iter().find(|t| t.id == id).and_then(|t| t.credential_id.clone());

                    let next = state.remove_setup_token(&id);
                    let next = match linked_credential {
                        Some(credential_id) => next.remove_credential(&credential_id, allow_remove_last)?,
                        None => next,
                    };
                    Ok(ModifierOutcome::save(next, ()))
                }
            })
            .await;
        match result {
            Ok(()) => Outcome::Success(()),
            Err(Error::LastCredential) => {
                Outcome::Failure(Failure::new(Reason::LastCredential, "refusing to remove the last credential"))
            },
            Err(e) => Outcome::Failure(infra_failure(e)),
        }
    }
}

fn infra_failure(e: Error) -> Failure {
    match e {
        Error::LockTimeout => Failure::new(Reason::LockTimeout, "timed out waiting for the state lock"),
        Error::LastCredential => {
            Failure::new(Reason::LastCredential, "refusing to remove the last credential")
        },
        other => Failure::new(Reason::CorruptState, other.to_string()),
    }
}

fn credential_to_stored(c: &Credential) -> Result<StoredCredential, serde_json::Error> {
    Ok(StoredCredential {
        id: c.id.clone(),
        passkey: serde_json::from_slice(&c.public_key)?,
    })
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn random_user_id() -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes::<16>())
}
