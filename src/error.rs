use std::time::Duration;

/// Errors produced by the session manager and the API client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input to login or another session mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The server rejected the credential (401) or a token refresh failed.
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Any other non-2xx response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A response body did not match the expected schema.
    #[error("Unexpected response: {0}")]
    Schema(String),

    #[error("OAuth error during {operation}: {detail}")]
    OAuth {
        operation: &'static str,
        detail: String,
    },

    #[error("Token error: {0}")]
    Token(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a caller-side retry may succeed: timeouts, transport failures
    /// and 5xx responses. Client errors are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthenticationRequired => Some(401),
            Self::Api { status, .. } => Some(*status),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Stable diagnostic code for logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AuthenticationRequired => "auth_required",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Api { .. } => "api",
            Self::Schema(_) => "schema",
            Self::OAuth { .. } => "oauth",
            Self::Token(_) => "token",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
        }
    }

    /// Message suitable for display. Timeouts and transport failures look
    /// the same to the end user; [`code`](Self::code) tells them apart.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout(_) | Self::Network(_) => {
                "Network error. Check your connection and try again.".into()
            }
            Self::AuthenticationRequired => "Your session has ended. Please sign in again.".into(),
            Self::Validation(msg) => msg.clone(),
            Self::Api { message, .. } => message.clone(),
            _ => "Something went wrong. Please try again.".into(),
        }
    }
}
