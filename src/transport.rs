//! Request execution shared by the session manager and the API client:
//! URL resolution, bearer injection, timeout and response normalization.
//! Auth policy (401/403 handling) lives in [`crate::api`].

use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use url::Url;

use crate::config::ClientConfig;
use crate::error::Error;

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub query: Vec<(String, String)>,
    /// Skip the `Authorization` header entirely.
    pub anonymous: bool,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }
}

/// Descriptor of an outbound call. Cheap to clone so it can be replayed
/// after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<JsonValue>,
    pub options: RequestOptions,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Normalized body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// 2xx with an empty body.
    Empty,
    Json(JsonValue),
    /// 2xx whose body was not valid JSON.
    Text(String),
}

impl Payload {
    /// Decode into a typed schema. `Empty` decodes as JSON `null`, so it
    /// fits `()` and `Option<T>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, Error> {
        let value = match self {
            Self::Empty => JsonValue::Null,
            Self::Json(value) => value,
            Self::Text(text) => {
                return Err(Error::Schema(format!(
                    "expected JSON, got text: {}",
                    truncate(&text, 120)
                )));
            }
        };
        serde_json::from_value(value).map_err(|e| Error::Schema(e.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Status and body of a completed exchange, before any interpretation.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub(crate) status: StatusCode,
    pub(crate) body: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl Transport {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cashbook-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http_client(config, http))
    }

    pub(crate) fn with_http_client(config: &ClientConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: config.base_url.clone(),
            timeout: config.request_timeout,
        }
    }

    /// Absolute URLs are accepted only on the API's own origin, so the
    /// bearer token never leaves it.
    pub(crate) fn resolve(&self, path: &str) -> Result<Url, Error> {
        if path.starts_with("http://") || path.starts_with("https://") {
            let url: Url = path
                .parse()
                .map_err(|e| Error::Config(format!("invalid request URL {path}: {e}")))?;
            if url.origin() != self.base_url.origin() {
                return Err(Error::Config(format!(
                    "refusing request to {}: outside the API origin {}",
                    url.origin().ascii_serialization(),
                    self.base_url.origin().ascii_serialization()
                )));
            }
            return Ok(url);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid request path {path}: {e}")))
    }

    /// Perform the exchange. The whole exchange, body included, is bounded
    /// by the timeout; on expiry the in-flight future is dropped, which
    /// aborts the connection.
    pub(crate) async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<RawResponse, Error> {
        let url = self.resolve(&request.path)?;
        let timeout = request.options.timeout.unwrap_or(self.timeout);

        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if !request.options.query.is_empty() {
            builder = builder.query(&request.options.query);
        }
        if let Some(token) = bearer.filter(|_| !request.options.anonymous) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>(RawResponse { status, body })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(raw)) => {
                tracing::debug!(
                    method = %request.method,
                    url = %url,
                    status = raw.status.as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                Ok(raw)
            }
            Ok(Err(e)) if e.is_timeout() => {
                tracing::warn!(method = %request.method, url = %url, "Request timed out");
                Err(Error::Timeout(timeout))
            }
            Ok(Err(e)) => {
                tracing::warn!(method = %request.method, url = %url, error = %e, "Request failed");
                Err(Error::Network(e))
            }
            Err(_) => {
                tracing::warn!(
                    method = %request.method,
                    url = %url,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Send and normalize in one step, with no auth policy applied.
    pub(crate) async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<Payload, Error> {
        let raw = self.send(request, bearer).await?;
        normalize(raw)
    }
}

/// Map a raw response to a payload (2xx) or a structured error.
pub(crate) fn normalize(raw: RawResponse) -> Result<Payload, Error> {
    if raw.status.is_success() {
        if raw.body.trim().is_empty() {
            return Ok(Payload::Empty);
        }
        return Ok(match serde_json::from_str::<JsonValue>(&raw.body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(raw.body),
        });
    }

    if raw.status == StatusCode::UNAUTHORIZED {
        return Err(Error::AuthenticationRequired);
    }

    Err(Error::Api {
        status: raw.status.as_u16(),
        message: error_message(raw.status, &raw.body),
    })
}

/// Human-readable message from an error body: `message`, then `title`,
/// then the status reason phrase.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|json| {
            ["message", "title"].iter().find_map(|key| {
                json.get(key)
                    .and_then(JsonValue::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_owned)
            })
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()))
        })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn raw(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn success_bodies_are_normalized() {
        assert_eq!(normalize(raw(204, "")).unwrap(), Payload::Empty);
        assert_eq!(normalize(raw(200, "  \n")).unwrap(), Payload::Empty);
        assert_eq!(
            normalize(raw(200, r#"{"ok":true}"#)).unwrap(),
            Payload::Json(serde_json::json!({"ok": true}))
        );
        assert_eq!(
            normalize(raw(200, "plain text")).unwrap(),
            Payload::Text("plain text".into())
        );
    }

    #[test]
    fn error_message_prefers_message_then_title() {
        let status = StatusCode::UNPROCESSABLE_ENTITY;
        assert_eq!(
            error_message(status, r#"{"message":"Amount must be positive","title":"x"}"#),
            "Amount must be positive"
        );
        assert_eq!(error_message(status, r#"{"title":"Invalid input"}"#), "Invalid input");
        assert_eq!(error_message(status, "<html>"), "Unprocessable Entity");
        assert_eq!(
            error_message(StatusCode::from_u16(599).unwrap(), ""),
            "Request failed with status 599"
        );
    }

    #[test]
    fn non_success_becomes_api_error() {
        let err = normalize(raw(404, r#"{"message":"Cashbook not found"}"#)).unwrap_err();
        assert!(matches!(
            err,
            Error::Api { status: 404, ref message } if message == "Cashbook not found"
        ));
        assert!(matches!(
            normalize(raw(401, "")),
            Err(Error::AuthenticationRequired)
        ));
    }

    #[test]
    fn payload_decode_checks_schema() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Business {
            id: String,
        }

        let ok: Business = Payload::Json(serde_json::json!({"id": "b-1"})).decode().unwrap();
        assert_eq!(ok, Business { id: "b-1".into() });

        let err = Payload::Json(serde_json::json!({"name": "x"}))
            .decode::<Business>()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        let none: Option<Business> = Payload::Empty.decode().unwrap();
        assert!(none.is_none());
        assert!(matches!(
            Payload::Text("oops".into()).decode::<Business>(),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn resolve_joins_against_base() {
        let config = ClientConfig::new("http://localhost:3000/api".parse().unwrap());
        let transport = Transport::new(&config).unwrap();
        assert_eq!(
            transport.resolve("/auth/login").unwrap().as_str(),
            "http://localhost:3000/api/auth/login"
        );
        assert_eq!(
            transport.resolve("businesses/42").unwrap().as_str(),
            "http://localhost:3000/api/businesses/42"
        );
        assert_eq!(
            transport.resolve("http://localhost:3000/files/1").unwrap().as_str(),
            "http://localhost:3000/files/1"
        );
    }

    #[test]
    fn resolve_rejects_foreign_origins() {
        let config = ClientConfig::new("http://localhost:3000/api".parse().unwrap());
        let transport = Transport::new(&config).unwrap();
        for url in [
            "https://other.example/x",
            "https://localhost:3000/api/x",
            "http://localhost:3001/api/x",
        ] {
            assert!(
                matches!(transport.resolve(url), Err(Error::Config(_))),
                "{url} should be rejected"
            );
        }
    }
}
