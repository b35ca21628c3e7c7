//! Schemas and calls for the `/auth/*` endpoints.
//!
//! These go straight through the transport: a refresh must never re-enter
//! the API client's 403 handling.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::error::Error;
use crate::token;
use crate::transport::{self, ApiRequest, Payload, Transport};
use crate::types::UserProfile;

/// Token pair returned by `/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TokenResponse {
    #[serde(alias = "access_token", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Expiry from `expiresIn`, else from the token's own `exp` claim.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        match self.expires_in {
            Some(secs) => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                OffsetDateTime::now_utc().checked_add(time::Duration::seconds(secs))
            }
            None => token::expiry_from_token(&self.access_token),
        }
    }
}

/// Response of `/auth/login` and `/auth/google`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenResponse,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// Body of `POST /auth/login`.
#[derive(Serialize)]
struct PasswordLogin<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthApi {
    transport: Transport,
}

impl AuthApi {
    pub(crate) fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub(crate) async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, Error> {
        let body = serde_json::to_value(PasswordLogin { email, password })
            .map_err(|e| Error::Schema(e.to_string()))?;
        let request = ApiRequest::new(Method::POST, "/auth/login").with_body(body);
        self.exchange(&request).await?.decode()
    }

    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
        let request = ApiRequest::new(Method::POST, "/auth/refresh")
            .with_body(json!({ "refreshToken": refresh_token }));
        let tokens: TokenResponse = self.transport.execute(&request, None).await?.decode()?;
        if tokens.access_token.trim().is_empty() {
            return Err(Error::Schema("refresh returned an empty access token".into()));
        }
        Ok(tokens)
    }

    pub(crate) async fn logout(&self, access_token: &str) -> Result<(), Error> {
        let request = ApiRequest::new(Method::POST, "/auth/logout");
        self.transport.execute(&request, Some(access_token)).await?;
        Ok(())
    }

    pub(crate) async fn me(&self, access_token: &str) -> Result<UserProfile, Error> {
        let request = ApiRequest::new(Method::GET, "/auth/me");
        let payload = self.transport.execute(&request, Some(access_token)).await?;
        // Some deployments wrap the profile as `{ "user": { ... } }`.
        match payload.decode::<serde_json::Value>()? {
            serde_json::Value::Object(mut map) if map.contains_key("user") => {
                let user = map.remove("user").unwrap_or_default();
                serde_json::from_value(user).map_err(|e| Error::Schema(e.to_string()))
            }
            other => serde_json::from_value(other).map_err(|e| Error::Schema(e.to_string())),
        }
    }

    #[cfg(feature = "oauth")]
    pub(crate) async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<AuthResponse, Error> {
        let request = ApiRequest::new(Method::POST, "/auth/google").with_body(json!({
            "code": code,
            "codeVerifier": code_verifier,
            "redirectUri": redirect_uri,
        }));
        self.exchange(&request).await?.decode()
    }

    /// Credential exchange: a 401 here means rejected credentials, not an
    /// expired session, so the server's message is kept.
    async fn exchange(&self, request: &ApiRequest) -> Result<Payload, Error> {
        let raw = self.transport.send(request, None).await?;
        if raw.status == StatusCode::UNAUTHORIZED {
            return Err(Error::Api {
                status: raw.status.as_u16(),
                message: transport::error_message(raw.status, &raw.body),
            });
        }
        transport::normalize(raw)
    }
}
