#![doc = include_str!("../README.md")]

pub mod api;
pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod navigator;
#[cfg(feature = "oauth")]
pub mod oauth;
pub mod retry;
pub mod session;
pub mod single_flight;
pub mod storage;
pub mod token;
pub mod transport;
pub mod types;

// Re-exports for convenient access
pub use api::ApiClient;
pub use auth::{AuthResponse, TokenResponse};
pub use config::ClientConfig;
pub use email::is_valid_email;
pub use error::Error;
pub use navigator::{LogNavigator, Navigator};
#[cfg(feature = "oauth")]
pub use oauth::{AuthorizationRequest, CallbackParams, OAuthConfig};
pub use retry::{RetryPolicy, with_backoff};
pub use session::{Credentials, RefreshTask, Session, SessionManager, SessionState};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use token::{UnverifiedClaims, decode_claims, expiry_from_token};
pub use transport::{ApiRequest, Payload, RequestOptions};
pub use types::{Email, Identity, UserId, UserProfile};
