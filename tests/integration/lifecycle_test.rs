//! Init, login, logout, and teardown behavior of the orchestrator.

use std::sync::atomic::Ordering;
use std::time::Duration;

use sessionguard::store::keys;
use sessionguard::{
    MemoryTokenStore, SessionError, SessionEventKind, SessionPhase, TokenStore,
};

use crate::test_harness::*;

#[tokio::test]
async fn test_init_with_empty_store_starts_logged_out() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    let session = orchestrator(&store, &gateway, quiet_config());

    session.init().await;

    let state = session.state();
    assert!(!state.is_authenticated);
    assert!(!state.is_loading);
    assert!(state.user.is_none());
    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert_eq!(gateway.verify_calls(), 0);
    assert_eq!(gateway.refresh_calls(), 0);
}

#[tokio::test]
async fn test_init_with_valid_token_verifies_once() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    assert_eq!(session.phase(), SessionPhase::Authenticated);
    assert_eq!(session.user().unwrap(), profile("u1"));
    // One verify, no refresh: the reload round trip is free of extra calls.
    assert_eq!(gateway.verify_calls(), 1);
    assert_eq!(gateway.refresh_calls(), 0);
    assert_eq!(next_event(&mut rx).await.kind, SessionEventKind::Login);
}

#[tokio::test]
async fn test_init_with_expired_token_refreshes_then_verifies() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, -10);
    let old_expiry: i64 = store.get(keys::EXPIRES_AT).unwrap().parse().unwrap();
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    assert_eq!(session.phase(), SessionPhase::Authenticated);
    assert_eq!(gateway.refresh_calls(), 1);
    assert_eq!(gateway.verify_calls(), 1);
    assert_eq!(
        store.get(keys::ACCESS_TOKEN),
        Some("access-refreshed".into())
    );
    let new_expiry: i64 = store.get(keys::EXPIRES_AT).unwrap().parse().unwrap();
    assert!(new_expiry > old_expiry, "expiry must move forward");

    assert_eq!(
        next_event(&mut rx).await.kind,
        SessionEventKind::TokenRefresh
    );
    assert_eq!(next_event(&mut rx).await.kind, SessionEventKind::Login);
}

#[tokio::test]
async fn test_init_verify_failure_falls_back_to_refresh() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    gateway.set_verify_result(Err(SessionError::Unauthorized));
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    // Verify fails, a refresh is attempted, and when the re-verify fails
    // too the session is ended rather than left in limbo.
    assert_eq!(gateway.verify_calls(), 2);
    assert_eq!(gateway.refresh_calls(), 1);
    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(store_is_cleared(&store));
    assert_eq!(
        next_event(&mut rx).await.kind,
        SessionEventKind::TokenRefresh
    );
    assert_eq!(
        next_event(&mut rx).await.kind,
        SessionEventKind::SessionExpired
    );
}

#[tokio::test]
async fn test_init_with_rejected_refresh_clears_and_expires() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    gateway.set_refresh_result(rejected_refresh());
    seed_session(&store, -10);
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(store_is_cleared(&store));
    assert_eq!(
        next_event(&mut rx).await.kind,
        SessionEventKind::SessionExpired
    );
    assert!(drain_kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_init_with_half_credential_pair_clears_store() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    // Access token without its refresh token: unusable on arrival.
    store.set(keys::ACCESS_TOKEN, "access-0");
    store.set(keys::EXPIRES_AT, "0");
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(store_is_cleared(&store));
    assert_eq!(gateway.refresh_calls(), 0);
    assert_eq!(next_event(&mut rx).await.kind, SessionEventKind::Error);
}

#[tokio::test]
async fn test_init_with_corrupt_user_json_clears_store() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    store.set(keys::USER, "{not json");
    let session = orchestrator(&store, &gateway, quiet_config());
    let mut rx = session.subscribe();

    session.init().await;

    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(store_is_cleared(&store));
    assert_eq!(next_event(&mut rx).await.kind, SessionEventKind::Error);
}

#[tokio::test]
async fn test_login_persists_credentials_and_emits() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    let mut rx = session.subscribe();

    let user = session.login("alice", "hunter2").await.unwrap();

    assert_eq!(user, profile("u1"));
    assert!(session.is_authenticated());
    assert_eq!(store.get(keys::ACCESS_TOKEN), Some("access-1".into()));
    assert_eq!(store.get(keys::REFRESH_TOKEN), Some("refresh-1".into()));
    assert!(store.get(keys::EXPIRES_AT).is_some());
    assert!(store.get(keys::USER).is_some());
    assert!(store.get(keys::SESSION_ID).is_some());
    assert_eq!(next_event(&mut rx).await.kind, SessionEventKind::Login);
}

#[tokio::test]
async fn test_login_failure_sets_error_and_emits_nothing() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    gateway.set_login_result(Err(SessionError::InvalidCredentials));
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    let mut rx = session.subscribe();

    let result = session.login("alice", "wrong").await;

    assert_eq!(result, Err(SessionError::InvalidCredentials));
    let state = session.state();
    assert!(!state.is_authenticated);
    assert!(!state.is_loading);
    assert_eq!(state.error.as_deref(), Some("invalid username or password"));
    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(store_is_cleared(&store));
    assert!(drain_kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_login_failure_leaves_existing_session_intact() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    assert!(session.is_authenticated());

    gateway.set_login_result(Err(SessionError::Network("connection refused".into())));
    let result = session.login("alice", "hunter2").await;

    assert!(result.is_err());
    assert!(session.is_authenticated());
    assert_eq!(session.phase(), SessionPhase::Authenticated);
    assert_eq!(session.user().unwrap(), profile("u1"));
    assert_eq!(store.get(keys::ACCESS_TOKEN), Some("access-0".into()));
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    let mut rx = session.subscribe();

    session.logout().await;
    session.logout().await;

    assert_eq!(session.phase(), SessionPhase::LoggedOut);
    assert!(!session.is_authenticated());
    assert!(store_is_cleared(&store));
    // One server call and one event; the second call found nothing to do.
    assert_eq!(gateway.logout_calls.load(Ordering::SeqCst), 1);
    assert_eq!(drain_kinds(&mut rx), vec![SessionEventKind::Logout]);
}

#[tokio::test]
async fn test_authenticated_state_always_carries_a_user() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());

    let check = |session: &sessionguard::SessionOrchestrator| {
        let state = session.state();
        assert!(
            !state.is_authenticated || state.user.is_some(),
            "authenticated state must carry a user"
        );
    };

    check(&session);
    session.init().await;
    check(&session);
    session.logout().await;
    check(&session);
    session.login("alice", "hunter2").await.unwrap();
    check(&session);
}

#[tokio::test]
async fn test_destroy_discards_inflight_refresh() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;

    gateway.set_refresh_delay(Duration::from_millis(200));
    let racer = session.clone();
    let refresh = tokio::spawn(async move { racer.force_refresh().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.destroy();

    assert!(!refresh.await.unwrap(), "late response must be discarded");
    assert_eq!(session.phase(), SessionPhase::Destroyed);
    // The response arrived after destroy and was not applied.
    assert_eq!(store.get(keys::ACCESS_TOKEN), Some("access-0".into()));
}

#[tokio::test]
async fn test_destroy_discards_inflight_logout() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    seed_session(&store, 3600);
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    let mut rx = session.subscribe();
    drain_kinds(&mut rx);

    gateway.set_logout_delay(Duration::from_millis(200));
    let racer = session.clone();
    let logout = tokio::spawn(async move { racer.logout().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.destroy();
    logout.await.unwrap();

    // The server round trip finished after destroy; nothing local changed.
    assert_eq!(session.phase(), SessionPhase::Destroyed);
    assert_eq!(store.get(keys::ACCESS_TOKEN), Some("access-0".into()));
    assert!(drain_kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_operations_after_destroy_are_refused() {
    let store = MemoryTokenStore::new();
    let gateway = MockAuthGateway::new();
    let session = orchestrator(&store, &gateway, quiet_config());
    session.init().await;
    session.destroy();

    assert_eq!(
        session.login("alice", "hunter2").await,
        Err(SessionError::Terminated)
    );
    assert!(!session.force_refresh().await);
    assert_eq!(session.phase(), SessionPhase::Destroyed);
}
