use derive_more::{Display, Into};
use serde::{Deserialize, Serialize};

use crate::email::is_valid_email;
use crate::error::Error;

/// Server-assigned user identifier (opaque, non-empty).
///
/// Use `UserId::try_from(string)` to create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Into)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.trim().is_empty() {
            Err(Error::Validation("user id must not be empty".into()))
        } else {
            Ok(Self(s))
        }
    }
}

/// Validated email address.
///
/// Guaranteed valid by construction: holding an `Email` proves the
/// `local@domain` shape was checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Into)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Email {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl TryFrom<String> for Email {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let trimmed = s.trim();
        if is_valid_email(trimmed) {
            Ok(Self(trimmed.to_owned()))
        } else {
            Err(Error::Validation(format!("invalid email address: {s:?}")))
        }
    }
}

/// Identity of the authenticated user. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Identity {
    #[serde(rename = "id")]
    pub user_id: UserId,
    pub email: Email,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// Untrusted user profile, as supplied by a caller or returned by the API.
///
/// Converted into an [`Identity`] with [`UserProfile::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UserProfile {
    #[serde(alias = "_id", alias = "userId")]
    pub id: String,
    pub email: String,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default, alias = "picture", alias = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub onboarding_completed: bool,
}

impl UserProfile {
    /// Create a profile with the required `id` and `email` fields.
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
        self.photo_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_onboarding_completed(mut self, completed: bool) -> Self {
        self.onboarding_completed = completed;
        self
    }

    /// Validate the id and email and produce an [`Identity`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the id is empty or the email is malformed.
    pub fn validate(&self) -> Result<Identity, Error> {
        Ok(Identity {
            user_id: UserId::try_from(self.id.clone())?,
            email: Email::try_from(self.email.clone())?,
            display_name: self.display_name.clone().filter(|n| !n.trim().is_empty()),
            photo_url: self.photo_url.clone().filter(|u| !u.trim().is_empty()),
        })
    }
}
