mod common;

use std::sync::Arc;
use std::time::Duration;

use cashbook_client::{
    ClientConfig, Credentials, Error, FileStorage, SessionManager, SessionState, SessionStorage,
    UserProfile,
};
use common::{eventually, expires_in, harness, jwt, sign_in, user_json};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn sign_in_with_password_establishes_session() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_partial_json(json!({ "email": "owner@example.com", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "t1",
            "refreshToken": "r1",
            "expiresIn": 900,
            "user": user_json(),
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let session = h
        .session
        .sign_in(" owner@example.com ", "hunter2")
        .await
        .unwrap();
    assert_eq!(session.identity().user_id.as_str(), "u-1");
    assert_eq!(session.identity().display_name.as_deref(), Some("Owner"));
    assert!(h.session.is_authenticated());
    assert_eq!(h.session.state(), SessionState::Authenticated);
    assert_eq!(h.session.post_login_route(), "/onboarding");
    assert_eq!(
        h.storage.get("cashbook.refresh_token").unwrap().as_deref(),
        Some("r1")
    );
}

#[tokio::test]
async fn sign_in_fetches_profile_when_response_has_none() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t1" })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .and(header("authorization", "Bearer t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": user_json() })))
        .expect(1)
        .mount(&h.server)
        .await;

    let session = h.session.sign_in("owner@example.com", "pw").await.unwrap();
    assert_eq!(session.access_token(), "t1");
    assert_eq!(session.identity().email.as_str(), "owner@example.com");
}

#[tokio::test]
async fn rejected_credentials_surface_server_message() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid email or password" })),
        )
        .mount(&h.server)
        .await;

    let err = h.session.sign_in("owner@example.com", "wrong").await.unwrap_err();
    assert!(matches!(err, Error::Api { status: 401, .. }));
    assert_eq!(h.session.state(), SessionState::Unauthenticated);
    assert_eq!(
        h.session.last_error().as_deref(),
        Some("Invalid email or password")
    );
    assert!(h.navigator.paths().is_empty());
}

#[tokio::test]
async fn malformed_email_is_rejected_before_any_request() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let err = h.session.sign_in("owner.example.com", "pw").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.session.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn malformed_login_response_is_a_schema_error() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&h.server)
        .await;

    let err = h.session.sign_in("owner@example.com", "pw").await.unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    assert!(!h.session.has_session());
    assert!(h.session.last_error().is_some());
}

#[tokio::test]
async fn refresh_clears_expiring_soon() {
    let h = harness().await;
    h.session
        .login(
            common::profile(),
            cashbook_client::Credentials::new("t1")
                .with_refresh_token("r1")
                .with_expires_at(expires_in(2)),
        )
        .unwrap();
    let buffer = Duration::from_secs(5 * 60);
    assert!(h.session.is_expiring_soon(buffer));

    let fresh = jwt(&json!({ "sub": "u-1", "exp": expires_in(60).unix_timestamp() }));
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": fresh })))
        .expect(1)
        .mount(&h.server)
        .await;

    let token = h.session.refresh().await.unwrap();
    assert_eq!(token, fresh);
    assert!(!h.session.is_expiring_soon(buffer));
    assert!(h.session.is_authenticated());
    // Refresh token is kept when the server does not rotate it.
    assert_eq!(
        h.session.session().unwrap().refresh_token(),
        Some("r1")
    );
}

#[tokio::test]
async fn refresh_network_failure_signs_out() {
    let h = harness().await;
    sign_in(&h.session);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;

    let err = h.session.refresh().await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationRequired));
    assert!(!h.session.has_session());
    assert!(h.storage.is_empty());
    assert_eq!(h.session.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn background_task_refreshes_expiring_token() {
    let h = harness().await;
    h.session
        .login(
            common::profile(),
            cashbook_client::Credentials::new("t1")
                .with_refresh_token("r1")
                .with_expires_at(expires_in(2)),
        )
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "t2", "expiresIn": 3600 })),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let task = h
        .session
        .spawn_refresh_task_with(Duration::from_millis(25), Duration::from_secs(5 * 60));
    let session = Arc::clone(&h.session);
    assert!(eventually(|| session.access_token().as_deref() == Some("t2")).await);

    // Token is no longer expiring, so further ticks do nothing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.stop();
}

#[tokio::test]
async fn dropping_the_task_handle_stops_it() {
    let h = harness().await;
    let task = h
        .session
        .spawn_refresh_task_with(Duration::from_millis(10), Duration::from_secs(60));
    assert!(!task.is_finished());
    drop(task);
}

#[tokio::test]
async fn restore_from_file_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("session.json");
    let config = ClientConfig::new("http://127.0.0.1:9/api".parse().unwrap());

    {
        let storage = Arc::new(FileStorage::open(&file).unwrap());
        let manager = SessionManager::new(config.clone(), storage).unwrap();
        sign_in(&manager);
    }

    let storage = Arc::new(FileStorage::open(&file).unwrap());
    let manager = SessionManager::new(config, storage).unwrap();
    let restored = manager.restore().unwrap();
    assert_eq!(restored.access_token(), "t1");
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn restore_discards_corrupted_user_blob() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("session.json");
    std::fs::write(
        &file,
        r#"{"cashbook.user":"{\"id\":","cashbook.access_token":"t1"}"#,
    )
    .unwrap();

    let storage = Arc::new(FileStorage::open(&file).unwrap());
    let manager = SessionManager::new(
        ClientConfig::new("http://127.0.0.1:9/api".parse().unwrap()),
        storage.clone(),
    )
    .unwrap();

    assert!(manager.restore().is_none());
    assert!(!manager.is_authenticated());
    assert!(storage.get("cashbook.user").unwrap().is_none());
    assert!(storage.get("cashbook.access_token").unwrap().is_none());
}

#[tokio::test]
async fn failed_refresh_of_replaced_session_keeps_new_session() {
    let h = harness().await;
    sign_in(&h.session);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_partial_json(json!({ "refreshToken": "r1" })))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_partial_json(json!({ "refreshToken": "r2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "t3" })))
        .expect(1)
        .mount(&h.server)
        .await;

    let stale = {
        let session = Arc::clone(&h.session);
        tokio::spawn(async move { session.refresh().await })
    };
    let session = Arc::clone(&h.session);
    assert!(eventually(|| session.state() == SessionState::RefreshPending).await);

    h.session
        .login(
            UserProfile::new("u-2", "second@example.com"),
            Credentials::new("new-token")
                .with_refresh_token("r2")
                .with_expires_at(expires_in(30)),
        )
        .unwrap();

    // The new session refreshes on its own, without queueing behind the old exchange.
    let token = tokio::time::timeout(Duration::from_millis(300), h.session.refresh())
        .await
        .expect("refresh waited on the replaced session")
        .unwrap();
    assert_eq!(token, "t3");

    let result = stale.await.unwrap();
    assert!(matches!(result, Err(Error::AuthenticationRequired)));
    assert!(h.session.has_session());
    assert_eq!(h.session.access_token().as_deref(), Some("t3"));
    assert_eq!(h.session.state(), SessionState::Authenticated);
    assert_eq!(h.storage.get("cashbook.access_token").unwrap().as_deref(), Some("t3"));
}

#[tokio::test]
async fn cancelled_refresh_restores_state() {
    let h = harness().await;
    sign_in(&h.session);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": "t2" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&h.server)
        .await;

    let elapsed = tokio::time::timeout(Duration::from_millis(100), h.session.refresh()).await;
    assert!(elapsed.is_err());

    assert_eq!(h.session.state(), SessionState::Authenticated);
    assert!(h.session.has_session());
    assert_eq!(h.session.access_token().as_deref(), Some("t1"));
}
