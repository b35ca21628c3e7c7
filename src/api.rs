//! Authenticated access to the CASHBOOK backend.
//!
//! Every call goes through [`ApiClient::request`], which attaches the bearer
//! token and applies the auth policy:
//!
//! - `401` signs the user out and sends them to the login surface.
//! - `403` with a user session refreshes the token once (shared by all
//!   concurrent callers) and replays the request with the new token.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::session::SessionManager;
use crate::transport::{self, ApiRequest, Payload, RequestOptions};

/// Which credential a request was sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Bearer {
    User(String),
    Dev(String),
    None,
}

impl Bearer {
    fn token(&self) -> Option<&str> {
        match self {
            Self::User(t) | Self::Dev(t) => Some(t),
            Self::None => None,
        }
    }
}

/// HTTP client bound to a [`SessionManager`].
///
/// Cheap to clone; clones share the session.
///
/// ```rust,ignore
/// let api = ApiClient::new(Arc::clone(&session));
/// let books: Vec<Cashbook> = api.get_json("/businesses/42/books").await?;
/// ```
#[derive(Clone)]
pub struct ApiClient {
    session: Arc<SessionManager>,
}

impl ApiClient {
    #[must_use]
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get(&self, path: &str) -> Result<Payload, Error> {
        self.get_with(path, RequestOptions::default()).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_with(&self, path: &str, options: RequestOptions) -> Result<Payload, Error> {
        self.request(ApiRequest::new(Method::GET, path).with_options(options))
            .await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post(&self, path: &str, body: Option<JsonValue>) -> Result<Payload, Error> {
        self.send_with_body(Method::POST, path, body, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post_with(
        &self,
        path: &str,
        body: Option<JsonValue>,
        options: RequestOptions,
    ) -> Result<Payload, Error> {
        self.send_with_body(Method::POST, path, body, options).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn put(&self, path: &str, body: Option<JsonValue>) -> Result<Payload, Error> {
        self.send_with_body(Method::PUT, path, body, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn put_with(
        &self,
        path: &str,
        body: Option<JsonValue>,
        options: RequestOptions,
    ) -> Result<Payload, Error> {
        self.send_with_body(Method::PUT, path, body, options).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete(&self, path: &str) -> Result<Payload, Error> {
        self.delete_with(path, RequestOptions::default()).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete_with(&self, path: &str, options: RequestOptions) -> Result<Payload, Error> {
        self.request(ApiRequest::new(Method::DELETE, path).with_options(options))
            .await
    }

    /// `GET` and decode into `T`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); [`Error::Schema`] if the body does not fit `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.get(path).await?.decode()
    }

    /// `POST` a serializable body and decode the response into `T`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); [`Error::Schema`] if the body cannot be
    /// serialized or the response does not fit `T`.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let body = serde_json::to_value(body).map_err(|e| Error::Schema(e.to_string()))?;
        self.post(path, Some(body)).await?.decode()
    }

    async fn send_with_body(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        options: RequestOptions,
    ) -> Result<Payload, Error> {
        let mut request = ApiRequest::new(method, path).with_options(options);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.request(request).await
    }

    /// Execute a request with the session's credential and auth policy.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthenticationRequired`] on 401, or when a 403-triggered
    ///   refresh fails. The session the request was sent with is cleared in
    ///   both cases; a session signed in meanwhile is left alone.
    /// - [`Error::Config`] for an absolute URL outside the API origin.
    /// - [`Error::Timeout`] and [`Error::Network`] for transport failures.
    /// - [`Error::Api`] for every other non-2xx response.
    pub async fn request(&self, request: ApiRequest) -> Result<Payload, Error> {
        let (generation, bearer) = self.bearer(&request);
        let raw = self
            .session
            .transport
            .send(&request, bearer.token())
            .await?;

        match raw.status {
            StatusCode::UNAUTHORIZED => Err(self.session.expire(generation)),
            StatusCode::FORBIDDEN if matches!(bearer, Bearer::User(_)) => {
                self.refresh_and_replay(&request, &bearer, generation).await
            }
            _ => transport::normalize(raw),
        }
    }

    /// Credential for `request`, with the session generation it belongs to.
    fn bearer(&self, request: &ApiRequest) -> (u64, Bearer) {
        let (generation, token) = self.session.credential();
        if request.options.anonymous {
            return (generation, Bearer::None);
        }
        if let Some(token) = token {
            return (generation, Bearer::User(token));
        }
        match self.session.config.dev_token() {
            Some(token) => (generation, Bearer::Dev(token.to_owned())),
            None => (generation, Bearer::None),
        }
    }

    async fn refresh_and_replay(
        &self,
        request: &ApiRequest,
        sent: &Bearer,
        generation: u64,
    ) -> Result<Payload, Error> {
        let (replay_generation, token) = match self.session.credential() {
            // Rotated by another caller, or a new sign-in, after this
            // request went out: replay with the current token.
            (current_generation, Some(current)) if Some(current.as_str()) != sent.token() => {
                (current_generation, current)
            }
            (_, Some(_)) => {
                tracing::debug!(path = %request.path, "Forbidden, refreshing access token");
                match self.session.refresh().await {
                    Ok(token) => (generation, token),
                    Err(_) => match self.session.credential() {
                        (now, Some(current)) if now != generation => (now, current),
                        _ => return Err(self.session.expire(generation)),
                    },
                }
            }
            (_, None) => return Err(self.session.expire(generation)),
        };

        let raw = self.session.transport.send(request, Some(&token)).await?;
        if raw.status == StatusCode::UNAUTHORIZED {
            return Err(self.session.expire(replay_generation));
        }
        transport::normalize(raw)
    }
}
