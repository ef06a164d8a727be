//! Integration tests exercising `AuthService` as an external consumer would:
//! through its public API only, against a real `StateStore` on a temp
//! directory and the deterministic `FakeVerifier`.

use keyhold_auth::service::{AuthService, RequestContext, ServiceConfig};
use keyhold_auth::store::StateStore;
use keyhold_auth::webauthn::fake::FakeVerifier;
use keyhold_auth::{Outcome, Reason};
use webauthn_rs::prelude::Url;

fn config() -> ServiceConfig {
    ServiceConfig {
        session_ttl_ms: 30 * 24 * 60 * 60 * 1000,
        session_refresh_threshold_ms: 24 * 60 * 60 * 1000,
        challenge_ttl_ms: 60_000,
        setup_token_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        lockout_max_attempts: 3,
        lockout_base_backoff_ms: 10,
        lockout_max_backoff_ms: 1_000,
    }
}

fn ctx() -> RequestContext {
    RequestContext {
        origin: Url::parse("http://localhost:8080").unwrap(),
        rp_id: "localhost".into(),
        rp_name: "keyhold".into(),
        is_local_request: true,
    }
}

async fn register_first_credential(service: &AuthService, credential_id: &str) -> keyhold_auth::IssuedSession {
    let challenge = service.generate_registration_options(&ctx(), None).await.unwrap();
    let result = service
        .verify_registration(
            &ctx(),
            &challenge.challenge_id,
            serde_json::json!({"id": credential_id}),
            Some("Primary Device".into()),
            Some("test-agent".into()),
        )
        .await
        .unwrap();
    result.session
}

#[tokio::test]
async fn setup_token_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());

    register_first_credential(&service, "cred-1").await;

    let created = service.create_setup_token("Guest phone").await.unwrap();
    let tokens = service.list_setup_tokens().await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].name, "Guest phone");

    service.rename_setup_token(&created.id, "Guest phone (renamed)").await.unwrap();
    let tokens = service.list_setup_tokens().await.unwrap();
    assert_eq!(tokens[0].name, "Guest phone (renamed)");

    // Revoking an unused token (no linked credential yet) only drops the
    // token, not any credential.
    service.revoke_setup_token(&ctx(), &created.id).await.unwrap();
    assert!(service.list_setup_tokens().await.unwrap().is_empty());
    assert_eq!(service.list_credentials().await.unwrap().len(), 1);
}

#[tokio::test]
async fn setup_token_revoked_between_options_and_verify_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
    register_first_credential(&service, "cred-1").await;

    let created = service.create_setup_token("Guest phone").await.unwrap();

    let challenge = service
        .generate_registration_options(&ctx(), Some(&created.token))
        .await
        .unwrap();

    // The token is deleted after options were issued but before the
    // ceremony is verified.
    service.revoke_setup_token(&ctx(), &created.id).await.unwrap();

    let result = service
        .verify_registration(
            &ctx(),
            &challenge.challenge_id,
            serde_json::json!({"id": "cred-2"}),
            None,
            None,
        )
        .await;

    match result {
        Outcome::Failure(f) => {
            assert!(matches!(f.reason, Reason::InvalidSetupToken));
            assert_eq!(f.status_code, 403);
        },
        Outcome::Success(_) => panic!("revoked setup token must not verify"),
    }
    assert_eq!(service.list_credentials().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_login_failures_lock_out_the_credential() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
    register_first_credential(&service, "cred-1").await;

    // The FakeVerifier inside AuthService is private; reach lockout purely
    // through repeated unknown-credential-adjacent failures is not possible
    // here, so drive it through a verifier that always rejects instead.
    let store2 = StateStore::new(dir.path(), "keyhold");
    let rejecting = FakeVerifier::default();
    rejecting.accept.store(false, std::sync::atomic::Ordering::SeqCst);
    let service2 = AuthService::new(store2, Box::new(rejecting), config());

    for _ in 0..3 {
        let challenge = service2.generate_login_options(&ctx()).await.unwrap();
        let result = service2
            .verify_login(&ctx(), &challenge.challenge_id, "cred-1", serde_json::json!({}))
            .await;
        assert!(matches!(result, Outcome::Failure(f) if matches!(f.reason, Reason::VerificationFailed)));
    }

    let challenge = service2.generate_login_options(&ctx()).await.unwrap();
    let result = service2
        .verify_login(&ctx(), &challenge.challenge_id, "cred-1", serde_json::json!({}))
        .await;
    match result {
        Outcome::Failure(f) => {
            assert!(matches!(f.reason, Reason::VerificationFailed));
            assert!(f.metadata.is_some(), "locked-out failure should carry retryAfterMs metadata");
        },
        Outcome::Success(_) => panic!("expected lockout to still be in effect"),
    }
}

#[tokio::test]
async fn revoke_all_drops_every_session_but_keeps_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
    register_first_credential(&service, "cred-1").await;

    let login_challenge = service.generate_login_options(&ctx()).await.unwrap();
    service
        .verify_login(&ctx(), &login_challenge.challenge_id, "cred-1", serde_json::json!({}))
        .await
        .unwrap();

    service.revoke_all().await.unwrap();

    // The service itself doesn't expose session count directly; reopening
    // the store and checking credentials survive is the externally
    // observable half of this guarantee.
    assert_eq!(service.list_credentials().await.unwrap().len(), 1);
}

#[tokio::test]
async fn state_persists_across_service_restarts() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = StateStore::new(dir.path(), "keyhold");
        let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
        register_first_credential(&service, "cred-1").await;
    }

    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
    let credentials = service.list_credentials().await.unwrap();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].id, "cred-1");
}

#[tokio::test]
async fn renaming_a_credential_to_an_empty_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path(), "keyhold");
    let service = AuthService::new(store, Box::new(FakeVerifier::default()), config());
    register_first_credential(&service, "cred-1").await;

    let result = service.rename_credential("cred-1", "").await;
    assert!(matches!(result, Outcome::Failure(f) if matches!(f.reason, Reason::TokenNameInvalid)));

    service.rename_credential("cred-1", "Work Laptop").await.unwrap();
    let credentials = service.list_credentials().await.unwrap();
    assert_eq!(credentials[0].name, "Work Laptop");
}
