//! The session manager: single source of truth for "is the user signed in,
//! and with what credential".

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::auth::{AuthApi, AuthResponse, TokenResponse};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::navigator::{LogNavigator, Navigator};
use crate::single_flight::{Flight, SingleFlight};
use crate::storage::{
    SessionStorage, ACCESS_TOKEN_KEY, AUTH_KEYS, EXPIRES_AT_KEY, ONBOARDING_KEY,
    REFRESH_TOKEN_KEY, USER_KEY,
};
use crate::token;
use crate::transport::Transport;
use crate::types::{Email, Identity, UserProfile};

pub const ONBOARDING_ROUTE: &str = "/onboarding";
pub const DASHBOARD_ROUTE: &str = "/dashboard";

/// Tokens handed to [`SessionManager::login`].
#[derive(Clone)]
#[non_exhaustive]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Explicit expiry. When absent it is read from the token's `exp` claim.
    pub expires_at: Option<OffsetDateTime>,
}

impl Credentials {
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, at: OffsetDateTime) -> Self {
        self.expires_at = Some(at);
        self
    }
}

impl From<TokenResponse> for Credentials {
    fn from(tokens: TokenResponse) -> Self {
        Self {
            expires_at: tokens.expires_at(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The authenticated user and their credentials.
#[derive(Clone)]
pub struct Session {
    identity: Identity,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<OffsetDateTime>,
    onboarding_completed: bool,
}

impl Session {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    #[must_use]
    pub fn onboarding_completed(&self) -> bool {
        self.onboarding_completed
    }

    /// A token is present and not past its expiry (if one is known).
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        !self.access_token.is_empty() && self.expires_at.map_or(true, |at| at > now)
    }

    /// Expiry is known and less than `buffer` away (or already past).
    #[must_use]
    pub fn is_expiring_within(&self, buffer: Duration, now: OffsetDateTime) -> bool {
        let buffer = time::Duration::try_from(buffer).unwrap_or(time::Duration::MAX);
        self.expires_at.is_some_and(|at| at - now < buffer)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("onboarding_completed", &self.onboarding_completed)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    RefreshPending,
}

struct Inner {
    session: Option<Session>,
    /// Bumped whenever the session is replaced or cleared; a refresh that
    /// started under an older generation is discarded.
    generation: u64,
    /// Refresh flight of the current generation. Callers of a new session
    /// never queue on a refresh started for an old one.
    flight: Arc<SingleFlight<String>>,
    redirected_at: Option<u64>,
    last_error: Option<String>,
}

impl Inner {
    fn advance(&mut self) {
        self.generation += 1;
        let stale = std::mem::replace(&mut self.flight, Arc::new(SingleFlight::new()));
        stale.abandon_waiters();
    }
}

/// Leaves `RefreshPending` however the refresh ends, including when the
/// refreshing future is dropped mid-flight.
struct PendingRefresh<'a> {
    manager: &'a SessionManager,
}

impl<'a> PendingRefresh<'a> {
    fn start(manager: &'a SessionManager) -> Self {
        manager.set_state(SessionState::RefreshPending);
        Self { manager }
    }
}

impl Drop for PendingRefresh<'_> {
    fn drop(&mut self) {
        let settled = if self.manager.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        self.manager.state.send_if_modified(|state| {
            if *state == SessionState::RefreshPending {
                *state = settled;
                true
            } else {
                false
            }
        });
    }
}

/// Owns the session lifecycle: restore at start-up, login, refresh, logout.
///
/// ```rust,ignore
/// let storage = Arc::new(FileStorage::open(data_dir.join("session.json"))?);
/// let session = Arc::new(SessionManager::new(ClientConfig::from_env()?, storage)?);
/// session.restore();
/// let _refresher = session.spawn_refresh_task();
/// let api = ApiClient::new(Arc::clone(&session));
/// ```
pub struct SessionManager {
    pub(crate) config: ClientConfig,
    pub(crate) storage: Arc<dyn SessionStorage>,
    pub(crate) transport: Transport,
    pub(crate) auth: AuthApi,
    pub(crate) navigator: Arc<dyn Navigator>,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, storage: Arc<dyn SessionStorage>) -> Result<Self, Error> {
        let transport = Transport::new(&config)?;
        Ok(Self::from_parts(config, storage, transport))
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(
        config: ClientConfig,
        storage: Arc<dyn SessionStorage>,
        http: reqwest::Client,
    ) -> Self {
        let transport = Transport::with_http_client(&config, http);
        Self::from_parts(config, storage, transport)
    }

    fn from_parts(config: ClientConfig, storage: Arc<dyn SessionStorage>, transport: Transport) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            auth: AuthApi::new(transport.clone()),
            config,
            storage,
            transport,
            navigator: Arc::new(LogNavigator),
            inner: Mutex::new(Inner {
                session: None,
                generation: 0,
                flight: Arc::new(SingleFlight::new()),
                redirected_at: None,
                last_error: None,
            }),
            state,
        }
    }

    #[must_use]
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ── Observation ────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Snapshot of the current session, including a cached but expired one.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.access_token.clone())
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Message of the last failed sign-in attempt, for inline display.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_valid_at(now))
    }

    #[must_use]
    pub fn is_expiring_soon(&self, buffer: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_expiring_within(buffer, now))
    }

    /// Where to send the user after signing in.
    #[must_use]
    pub fn post_login_route(&self) -> &'static str {
        match self.lock().session.as_ref() {
            Some(s) if !s.onboarding_completed => ONBOARDING_ROUTE,
            _ => DASHBOARD_ROUTE,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Load the persisted session. Corrupted or partial state is cleared and
    /// treated as "no session"; this never fails.
    pub fn restore(&self) -> Option<Session> {
        let session = match self.read_persisted() {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.set_state(SessionState::Unauthenticated);
                return None;
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "Discarding corrupted persisted session");
                self.clear_storage();
                self.set_state(SessionState::Unauthenticated);
                return None;
            }
        };

        let now = OffsetDateTime::now_utc();
        if !session.is_valid_at(now) && session.refresh_token.is_none() {
            tracing::info!("Persisted session expired with no refresh token");
            self.clear_storage();
            self.set_state(SessionState::Unauthenticated);
            return None;
        }

        let valid = session.is_valid_at(now);
        {
            let mut inner = self.lock();
            inner.session = Some(session.clone());
            inner.advance();
        }
        self.set_state(if valid {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        });
        tracing::info!(
            user_id = %session.identity.user_id,
            authenticated = valid,
            "Session restored"
        );
        Some(session)
    }

    fn read_persisted(&self) -> Result<Option<Session>, String> {
        let get = |key: &str| -> Result<Option<String>, String> {
            self.storage
                .get(key)
                .map(|v| v.filter(|s| !s.trim().is_empty()))
                .map_err(|e| e.to_string())
        };

        let (user, access_token) = match (get(USER_KEY)?, get(ACCESS_TOKEN_KEY)?) {
            (None, None) => return Ok(None),
            (Some(user), Some(token)) => (user, token),
            (Some(_), None) => return Err("user present without access token".into()),
            (None, Some(_)) => return Err("access token present without user".into()),
        };

        let identity: Identity =
            serde_json::from_str(&user).map_err(|e| format!("invalid user blob: {e}"))?;

        let expires_at = match get(EXPIRES_AT_KEY)? {
            Some(raw) => {
                let secs: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| format!("invalid expiry: {e}"))?;
                Some(
                    OffsetDateTime::from_unix_timestamp(secs)
                        .map_err(|e| format!("invalid expiry: {e}"))?,
                )
            }
            None => token::expiry_from_token(&access_token),
        };

        Ok(Some(Session {
            identity,
            refresh_token: get(REFRESH_TOKEN_KEY)?,
            expires_at,
            onboarding_completed: get(ONBOARDING_KEY)?.as_deref() == Some("true"),
            access_token,
        }))
    }

    /// Establish a session for `profile` with `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] (state unchanged) if the id is empty,
    /// the email is malformed or the access token is empty, and
    /// [`Error::Storage`] if persisting fails (nothing is left persisted).
    pub fn login(&self, profile: UserProfile, credentials: Credentials) -> Result<Session, Error> {
        let identity = profile.validate()?;
        if credentials.access_token.trim().is_empty() {
            return Err(Error::Validation("access token must not be empty".into()));
        }

        self.set_state(SessionState::Authenticating);

        let expires_at = credentials
            .expires_at
            .or_else(|| token::expiry_from_token(&credentials.access_token));
        let session = Session {
            identity,
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token.filter(|t| !t.trim().is_empty()),
            expires_at,
            onboarding_completed: profile.onboarding_completed,
        };

        if let Err(e) = self.persist(&session) {
            tracing::error!(error = %e, "Failed to persist session");
            self.clear_storage();
            {
                let mut inner = self.lock();
                if inner.session.take().is_some() {
                    inner.advance();
                }
            }
            return Err(self.fail_authentication(e));
        }

        {
            let mut inner = self.lock();
            inner.session = Some(session.clone());
            inner.advance();
            inner.last_error = None;
        }
        self.set_state(SessionState::Authenticated);
        tracing::info!(user_id = %session.identity.user_id, "Signed in");
        Ok(session)
    }

    /// Clear the session from memory and storage. Idempotent.
    pub fn logout(&self) {
        self.logout_if(None);
    }

    /// Logout, unless `generation` is given and the session has moved past
    /// it. Returns whether the logout happened.
    fn logout_if(&self, generation: Option<u64>) -> bool {
        let had_session = {
            let mut inner = self.lock();
            if generation.is_some_and(|g| g != inner.generation) {
                return false;
            }
            let had = inner.session.take().is_some();
            if had {
                inner.advance();
            }
            had
        };
        self.clear_storage();
        self.set_state(SessionState::Unauthenticated);
        if had_session {
            tracing::info!("Signed out");
        }
        true
    }

    /// Generation and access token, read together.
    pub(crate) fn credential(&self) -> (u64, Option<String>) {
        let inner = self.lock();
        let token = inner.session.as_ref().map(|s| s.access_token.clone());
        (inner.generation, token)
    }

    /// Sign in with email and password via `POST /auth/login`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a malformed email or empty password (state
    /// unchanged); otherwise any network, API or schema error, after which
    /// [`last_error`](Self::last_error) holds a displayable message.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        let email: Email = email.parse()?;
        if password.is_empty() {
            return Err(Error::Validation("password must not be empty".into()));
        }

        self.set_state(SessionState::Authenticating);
        let result = match self.auth.login(email.as_str(), password).await {
            Ok(response) => self.establish(response).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| self.fail_authentication(e))
    }

    /// Best-effort server-side logout, then [`logout`](Self::logout).
    pub async fn sign_out(&self) {
        if let Some(token) = self.access_token() {
            if let Err(e) = self.auth.logout(&token).await {
                tracing::debug!(error = %e, "Server-side logout failed");
            }
        }
        self.logout();
    }

    /// Mark onboarding as done for the current session.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationRequired`] without a session, or
    /// [`Error::Storage`] if the flag cannot be persisted.
    pub fn complete_onboarding(&self) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            let session = inner
                .session
                .as_mut()
                .ok_or(Error::AuthenticationRequired)?;
            session.onboarding_completed = true;
        }
        self.storage.set(ONBOARDING_KEY, "true")
    }

    /// Turn an auth endpoint response into a session, fetching the profile
    /// from `/auth/me` when the response does not carry one.
    pub(crate) async fn establish(&self, response: AuthResponse) -> Result<Session, Error> {
        let profile = match response.user {
            Some(user) => user,
            None => self.auth.me(&response.tokens.access_token).await?,
        };
        self.login(profile, Credentials::from(response.tokens))
    }

    /// Leave `Authenticating` after a failure and remember the message.
    pub(crate) fn fail_authentication(&self, err: Error) -> Error {
        let now = OffsetDateTime::now_utc();
        let valid = {
            let mut inner = self.lock();
            inner.last_error = Some(err.user_message());
            inner.session.as_ref().is_some_and(|s| s.is_valid_at(now))
        };
        self.set_state(if valid {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        });
        tracing::warn!(error = %err, code = err.code(), "Authentication failed");
        err
    }

    /// The 401 path for a credential issued under `generation`: clear the
    /// session, reject everything queued on its refresh and send the user
    /// to the login surface (once per session). A no-op when the session
    /// has already been replaced or cleared.
    pub(crate) fn expire(&self, generation: u64) -> Error {
        if !self.logout_if(Some(generation)) {
            tracing::debug!("Rejected credential belongs to a replaced session");
            return Error::AuthenticationRequired;
        }
        let (rejected, redirect) = {
            let mut inner = self.lock();
            let rejected = inner.flight.abandon_waiters();
            let generation = inner.generation;
            let redirect = inner.redirected_at != Some(generation);
            inner.redirected_at = Some(generation);
            (rejected, redirect)
        };
        if redirect {
            tracing::warn!(rejected, "Session rejected by server, redirecting to login");
            self.navigator.redirect(&self.config.login_path);
        }
        Error::AuthenticationRequired
    }

    // ── Refresh ────────────────────────────────────────────────────

    /// Exchange the refresh token for a new access token.
    ///
    /// Only one exchange runs at a time per session; concurrent callers wait
    /// for it and observe the same token or the same failure. A failure
    /// signs the user out, unless a different session was established while
    /// the exchange was running.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationRequired`] if there is no refresh token or the
    /// exchange fails.
    pub async fn refresh(&self) -> Result<String, Error> {
        let (generation, flight) = {
            let inner = self.lock();
            (inner.generation, Arc::clone(&inner.flight))
        };
        let result = match flight.join() {
            Flight::Follower(follower) => {
                tracing::debug!("Waiting on in-flight token refresh");
                follower.wait().await.ok_or(Error::AuthenticationRequired)
            }
            Flight::Leader(leader) => {
                let outcome = self.run_refresh(generation).await;
                leader.complete(outcome.as_ref().ok().cloned());
                outcome
            }
        };
        result
    }

    async fn run_refresh(&self, generation: u64) -> Result<String, Error> {
        let refresh_token = {
            let inner = self.lock();
            if inner.generation != generation {
                return Err(Error::AuthenticationRequired);
            }
            inner.session.as_ref().and_then(|s| s.refresh_token.clone())
        };
        let Some(refresh_token) = refresh_token else {
            tracing::warn!("Token refresh requested without a refresh token");
            self.logout_if(Some(generation));
            return Err(Error::AuthenticationRequired);
        };

        let _pending = PendingRefresh::start(self);
        match self.auth.refresh(&refresh_token).await {
            Ok(tokens) => self.apply_refresh(generation, tokens),
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "Token refresh failed");
                if !self.logout_if(Some(generation)) {
                    tracing::debug!("Session changed during refresh, keeping it");
                }
                Err(Error::AuthenticationRequired)
            }
        }
    }

    fn apply_refresh(&self, generation: u64, tokens: TokenResponse) -> Result<String, Error> {
        let expires_at = tokens.expires_at();
        let session = {
            let mut inner = self.lock();
            if inner.generation != generation {
                tracing::debug!("Session changed during refresh, discarding new token");
                return Err(Error::AuthenticationRequired);
            }
            let Some(session) = inner.session.as_mut() else {
                return Err(Error::AuthenticationRequired);
            };
            session.access_token = tokens.access_token;
            session.expires_at = expires_at;
            if let Some(rotated) = tokens.refresh_token.filter(|t| !t.trim().is_empty()) {
                session.refresh_token = Some(rotated);
            }
            session.clone()
        };

        if let Err(e) = self.persist(&session) {
            tracing::warn!(error = %e, "Failed to persist refreshed token");
        }
        self.set_state(SessionState::Authenticated);
        tracing::info!(
            expires_at = ?session.expires_at.map(OffsetDateTime::unix_timestamp),
            "Access token refreshed"
        );
        Ok(session.access_token)
    }

    /// A refresh token exists and the access token is within `buffer` of expiry.
    #[must_use]
    pub fn refresh_due(&self, buffer: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.refresh_token.is_some() && s.is_expiring_within(buffer, now))
    }

    /// Start the background refresher with the configured interval and buffer.
    #[must_use]
    pub fn spawn_refresh_task(self: &Arc<Self>) -> RefreshTask {
        self.spawn_refresh_task_with(self.config.refresh_interval, self.config.refresh_buffer)
    }

    /// Every `every`, refresh if the token expires within `buffer`.
    /// The task holds only a weak reference and ends with the manager.
    #[must_use]
    pub fn spawn_refresh_task_with(self: &Arc<Self>, every: Duration, buffer: Duration) -> RefreshTask {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.refresh_due(buffer) {
                    tracing::debug!("Access token expiring soon, refreshing in background");
                    if let Err(e) = manager.refresh().await {
                        tracing::info!(error = %e, "Background refresh failed");
                    }
                }
            }
        });
        RefreshTask { handle }
    }

    // ── Persistence ────────────────────────────────────────────────

    fn persist(&self, session: &Session) -> Result<(), Error> {
        let user = serde_json::to_string(&session.identity)
            .map_err(|e| Error::Storage(format!("serialize user: {e}")))?;
        self.storage.set(USER_KEY, &user)?;
        self.storage.set(ACCESS_TOKEN_KEY, &session.access_token)?;
        match &session.refresh_token {
            Some(token) => self.storage.set(REFRESH_TOKEN_KEY, token)?,
            None => self.storage.remove(REFRESH_TOKEN_KEY)?,
        }
        match session.expires_at {
            Some(at) => self
                .storage
                .set(EXPIRES_AT_KEY, &at.unix_timestamp().to_string())?,
            None => self.storage.remove(EXPIRES_AT_KEY)?,
        }
        self.storage.set(
            ONBOARDING_KEY,
            if session.onboarding_completed { "true" } else { "false" },
        )
    }

    fn clear_storage(&self) {
        for key in AUTH_KEYS {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!(key, error = %e, "Failed to clear persisted key");
            }
        }
    }
}

/// Handle to the background refresher. Dropping it stops the task.
#[derive(Debug)]
pub struct RefreshTask {
    handle: JoinHandle<()>,
}

impl RefreshTask {
    pub fn stop(self) {
        drop(self);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
