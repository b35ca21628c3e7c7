/// UI-side navigation, implemented by the consuming application.
///
/// The client calls [`redirect`](Navigator::redirect) when the user must be
/// sent somewhere: the login surface after a 401, or the post-login route
/// after an OAuth callback.
pub trait Navigator: Send + Sync + 'static {
    fn redirect(&self, path: &str);
}

/// Default navigator: records the request in the log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect(&self, path: &str) {
        tracing::info!(path = %path, "Navigation requested");
    }
}

/// Login path carrying an error code, e.g. `/login?error=state_mismatch`.
#[must_use]
pub fn login_error_path(login_path: &str, code: &str) -> String {
    let encoded = urlencoding::encode(code);
    let separator = if login_path.contains('?') { '&' } else { '?' };
    format!("{login_path}{separator}error={encoded}")
}
