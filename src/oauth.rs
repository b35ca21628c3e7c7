//! Google sign-in through the authorization-code flow with PKCE.
//!
//! [`SessionManager::begin_oauth`] builds the provider URL and persists the
//! `state` nonce and code verifier; [`SessionManager::complete_oauth`]
//! checks the callback against them and exchanges the code through the
//! backend (`POST /auth/google`).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::Error;
use crate::navigator::login_error_path;
use crate::session::{Session, SessionManager, SessionState};
use crate::storage::{OAUTH_STATE_KEY, OAUTH_VERIFIER_KEY};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// OAuth provider configuration.
///
/// ```rust,ignore
/// let oauth = OAuthConfig::new("1234.apps.googleusercontent.com", "myapp://auth/callback".parse()?);
/// let config = ClientConfig::new(api_url).with_oauth(oauth);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) auth_url: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
}

impl OAuthConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            auth_url: GOOGLE_AUTH_URL.parse().expect("valid default URL"),
            scopes: vec!["openid".into(), "email".into(), "profile".into()],
        }
    }

    /// Override the provider authorization endpoint.
    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    /// Override the scopes (default: `["openid", "email", "profile"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Provider URL plus the nonce and verifier to hold until the callback.
    #[must_use]
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let state = generate_state();
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let scope = self.scopes.join(" ");

        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        AuthorizationRequest {
            url,
            state,
            code_verifier,
        }
    }
}

/// Authorization URL with the parameters that must survive until the callback.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub code_verifier: String,
}

/// Query parameters of the provider redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a raw query string, with or without the leading `?`.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let query = query.trim_start_matches('?');
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }

    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or_default())
    }
}

/// Random PKCE code verifier: 64 URL-safe characters (RFC 7636 allows 43-128).
#[must_use]
pub fn generate_code_verifier() -> String {
    let random_bytes: [u8; 48] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` nonce: 22 URL-safe characters.
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Why a callback was rejected. Carried to the login surface as `?error=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackFailure {
    Provider,
    StateMismatch,
    MissingCode,
    Exchange,
}

impl CallbackFailure {
    fn code(self) -> &'static str {
        match self {
            Self::Provider => "oauth_error",
            Self::StateMismatch => "state_mismatch",
            Self::MissingCode => "missing_code",
            Self::Exchange => "token_exchange_failed",
        }
    }
}

impl SessionManager {
    /// Start Google sign-in. Open the returned URL in a browser.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when OAuth is not configured, or
    /// [`Error::Storage`] if the nonce cannot be persisted.
    pub fn begin_oauth(&self) -> Result<AuthorizationRequest, Error> {
        let oauth = self
            .config
            .oauth()
            .ok_or_else(|| Error::Config("OAuth is not configured".into()))?;
        let request = oauth.authorization_request();
        self.storage.set(OAUTH_STATE_KEY, &request.state)?;
        self.storage.set(OAUTH_VERIFIER_KEY, &request.code_verifier)?;
        tracing::debug!("OAuth authorization started");
        Ok(request)
    }

    /// Handle the provider redirect.
    ///
    /// On success the navigator is sent to the post-login route; on failure
    /// to the login path with an `error` code.
    ///
    /// # Errors
    ///
    /// [`Error::OAuth`] for a provider-reported error, [`Error::Validation`]
    /// for a missing or mismatched `state` or a missing `code`, and any error
    /// from the code exchange.
    pub async fn complete_oauth(&self, params: &CallbackParams) -> Result<Session, Error> {
        match self.run_oauth_callback(params).await {
            Ok(session) => {
                self.navigator.redirect(self.post_login_route());
                Ok(session)
            }
            Err((failure, err)) => {
                if failure == CallbackFailure::StateMismatch {
                    tracing::warn!("OAuth state mismatch, rejecting callback");
                }
                let err = self.fail_authentication(err);
                self.navigator
                    .redirect(&login_error_path(&self.config.login_path, failure.code()));
                Err(err)
            }
        }
    }

    async fn run_oauth_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<Session, (CallbackFailure, Error)> {
        let (expected_state, verifier) = self
            .take_oauth_nonce()
            .map_err(|e| (CallbackFailure::StateMismatch, e))?;

        if let Some(error) = &params.error {
            let detail = match &params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            };
            return Err((
                CallbackFailure::Provider,
                Error::OAuth {
                    operation: "authorization",
                    detail,
                },
            ));
        }

        match (&params.state, &expected_state) {
            (Some(got), Some(expected)) if got == expected => {}
            _ => {
                return Err((
                    CallbackFailure::StateMismatch,
                    Error::Validation("OAuth state does not match".into()),
                ));
            }
        }

        let Some(code) = &params.code else {
            return Err((
                CallbackFailure::MissingCode,
                Error::Validation("OAuth callback is missing the authorization code".into()),
            ));
        };
        let Some(verifier) = verifier else {
            return Err((
                CallbackFailure::StateMismatch,
                Error::Validation("OAuth code verifier is missing".into()),
            ));
        };

        let redirect_uri = self
            .config
            .oauth()
            .map(|o| o.redirect_uri.to_string())
            .ok_or_else(|| {
                (
                    CallbackFailure::Exchange,
                    Error::Config("OAuth is not configured".into()),
                )
            })?;

        self.set_state(SessionState::Authenticating);
        let response = self
            .auth
            .exchange_code(code, &verifier, &redirect_uri)
            .await
            .map_err(|e| (CallbackFailure::Exchange, e))?;
        self.establish(response)
            .await
            .map_err(|e| (CallbackFailure::Exchange, e))
    }

    /// Read and remove the persisted nonce and verifier.
    fn take_oauth_nonce(&self) -> Result<(Option<String>, Option<String>), Error> {
        let state = self.storage.get(OAUTH_STATE_KEY)?;
        let verifier = self.storage.get(OAUTH_VERIFIER_KEY)?;
        self.storage.remove(OAUTH_STATE_KEY)?;
        self.storage.remove(OAUTH_VERIFIER_KEY)?;
        Ok((state, verifier))
    }
}
