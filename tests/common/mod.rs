#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cashbook_client::{
    ApiClient, ClientConfig, Credentials, MemoryStorage, Navigator, SessionManager, UserProfile,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use wiremock::MockServer;

/// Navigator that remembers every redirect.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, path: &str) {
        self.paths.lock().unwrap().push(path.to_string());
    }
}

pub struct Harness {
    pub server: MockServer,
    pub storage: Arc<MemoryStorage>,
    pub navigator: Arc<RecordingNavigator>,
    pub session: Arc<SessionManager>,
    pub api: ApiClient,
}

pub async fn harness() -> Harness {
    harness_with(|config| config).await
}

pub async fn harness_with(configure: impl FnOnce(ClientConfig) -> ClientConfig) -> Harness {
    let server = MockServer::start().await;
    let config = configure(ClientConfig::new(
        format!("{}/api", server.uri()).parse().unwrap(),
    ));
    let storage = Arc::new(MemoryStorage::new());
    let navigator = Arc::new(RecordingNavigator::default());
    let session = Arc::new(
        SessionManager::new(config, storage.clone())
            .unwrap()
            .with_navigator(navigator.clone()),
    );
    let api = ApiClient::new(Arc::clone(&session));
    Harness {
        server,
        storage,
        navigator,
        session,
        api,
    }
}

pub fn profile() -> UserProfile {
    UserProfile::new("u-1", "owner@example.com").with_display_name("Owner")
}

pub fn user_json() -> Value {
    json!({ "id": "u-1", "email": "owner@example.com", "name": "Owner", "onboardingCompleted": false })
}

pub fn expires_in(minutes: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::minutes(minutes)
}

/// Signed-in session with access `t1` and refresh `r1`, valid for 30 minutes.
pub fn sign_in(session: &SessionManager) {
    session
        .login(
            profile(),
            Credentials::new("t1")
                .with_refresh_token("r1")
                .with_expires_at(expires_in(30)),
        )
        .unwrap();
}

/// Unsigned JWT carrying `claims`; only the payload is ever read.
pub fn jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
