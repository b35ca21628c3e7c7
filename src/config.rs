use std::time::Duration;

use url::Url;

use crate::error::Error;
#[cfg(feature = "oauth")]
use crate::oauth::OAuthConfig;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Client configuration.
///
/// The required field (`base_url`) is a constructor parameter; everything
/// else has a default and a `with_*` override.
///
/// ```rust,ignore
/// use cashbook_client::ClientConfig;
///
/// let config = ClientConfig::new("https://api.cashbook.app/v1".parse()?)
///     .with_request_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) request_timeout: Duration,
    pub(crate) refresh_buffer: Duration,
    pub(crate) refresh_interval: Duration,
    pub(crate) login_path: String,
    pub(crate) dev_token: Option<String>,
    #[cfg(feature = "oauth")]
    pub(crate) oauth: Option<OAuthConfig>,
}

impl ClientConfig {
    /// Create a configuration for the API rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: with_trailing_slash(base_url),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            login_path: "/login".into(),
            dev_token: None,
            #[cfg(feature = "oauth")]
            oauth: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `CASHBOOK_API_URL`: API base URL
    ///
    /// # Optional env vars
    /// - `CASHBOOK_REQUEST_TIMEOUT_MS`: per-request timeout in milliseconds
    /// - `CASHBOOK_GOOGLE_CLIENT_ID` and `CASHBOOK_OAUTH_REDIRECT_URI`: enable Google sign-in (both or neither)
    /// - `CASHBOOK_DEV_TOKEN`: bearer token used when no user is signed in (debug builds only)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or values are malformed.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let base_url: Url = lookup("CASHBOOK_API_URL")
            .ok_or_else(|| Error::Config("CASHBOOK_API_URL is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("CASHBOOK_API_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Some(ms) = lookup("CASHBOOK_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("CASHBOOK_REQUEST_TIMEOUT_MS: {e}")))?;
            if ms == 0 {
                return Err(Error::Config(
                    "CASHBOOK_REQUEST_TIMEOUT_MS must be greater than zero".into(),
                ));
            }
            config = config.with_request_timeout(Duration::from_millis(ms));
        }

        #[cfg(feature = "oauth")]
        let mut config = config.with_oauth_from_lookup(&lookup)?;

        if let Some(token) = lookup("CASHBOOK_DEV_TOKEN").filter(|t| !t.trim().is_empty()) {
            config = config.with_dev_token(token);
        }

        Ok(config)
    }

    #[cfg(feature = "oauth")]
    fn with_oauth_from_lookup(
        self,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        match (
            lookup("CASHBOOK_GOOGLE_CLIENT_ID"),
            lookup("CASHBOOK_OAUTH_REDIRECT_URI"),
        ) {
            (Some(client_id), Some(redirect)) => {
                let redirect_uri: Url = redirect
                    .parse()
                    .map_err(|e| Error::Config(format!("CASHBOOK_OAUTH_REDIRECT_URI: {e}")))?;
                Ok(self.with_oauth(OAuthConfig::new(client_id, redirect_uri)))
            }
            (None, None) => Ok(self),
            _ => Err(Error::Config(
                "CASHBOOK_GOOGLE_CLIENT_ID and CASHBOOK_OAUTH_REDIRECT_URI must be set together"
                    .into(),
            )),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long before expiry a token counts as "expiring soon".
    #[must_use]
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// How often the background task checks the token expiry.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Development bearer token, used only when no user session exists.
    /// Ignored in release builds.
    #[must_use]
    pub fn with_dev_token(mut self, token: impl Into<String>) -> Self {
        self.dev_token = Some(token.into());
        self
    }

    #[cfg(feature = "oauth")]
    #[must_use]
    pub fn with_oauth(mut self, oauth: OAuthConfig) -> Self {
        self.oauth = Some(oauth);
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    /// The development token, if configured and this is a debug build.
    #[must_use]
    pub fn dev_token(&self) -> Option<&str> {
        if cfg!(debug_assertions) {
            self.dev_token.as_deref()
        } else {
            None
        }
    }

    #[cfg(feature = "oauth")]
    #[must_use]
    pub fn oauth(&self) -> Option<&OAuthConfig> {
        self.oauth.as_ref()
    }
}

/// `Url::join` replaces the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
