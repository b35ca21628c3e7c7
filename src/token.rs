use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::Error;

/// Claims read from a JWT payload without verifying its signature.
///
/// The client never trusts these for authorization decisions; they only
/// tell it when the server will start rejecting the token.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims {
    inner: JsonValue,
}

impl UnverifiedClaims {
    /// Gets a claim value by key.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    /// Gets the inner JSON value.
    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.inner
    }

    /// The `exp` claim as an instant, if present and numeric.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let exp = self.inner.get("exp")?;
        let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
        OffsetDateTime::from_unix_timestamp(secs).ok()
    }
}

/// Decodes the payload segment of a `header.payload.signature` token.
///
/// # Errors
///
/// Returns `Error::Token` if the token does not have three segments or the
/// payload is not base64url-encoded JSON object.
pub fn decode_claims(token_str: &str) -> Result<UnverifiedClaims, Error> {
    let parts: Vec<&str> = token_str.split('.').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(Error::Token("not a JWT".into()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| Error::Token("invalid payload encoding".into()))?;

    let json_value: JsonValue = serde_json::from_slice(&payload)
        .map_err(|e| Error::Token(format!("invalid payload: {e}")))?;
    if !json_value.is_object() {
        return Err(Error::Token("payload is not an object".into()));
    }

    Ok(UnverifiedClaims { inner: json_value })
}

/// Expiry of an access token, when it is a JWT carrying `exp`.
/// Opaque tokens yield `None`.
#[must_use]
pub fn expiry_from_token(token_str: &str) -> Option<OffsetDateTime> {
    decode_claims(token_str).ok()?.expires_at()
}

#[cfg(test)]
pub(crate) fn test_jwt(claims: &JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
