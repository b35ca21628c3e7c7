//! Durable key/value storage for the persisted session.
//!
//! Values are plain strings; JSON-encoded structures are parsed by the
//! session manager, never by the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Error;

pub const ACCESS_TOKEN_KEY: &str = "cashbook.access_token";
pub const REFRESH_TOKEN_KEY: &str = "cashbook.refresh_token";
pub const USER_KEY: &str = "cashbook.user";
pub const EXPIRES_AT_KEY: &str = "cashbook.expires_at";
pub const ONBOARDING_KEY: &str = "cashbook.onboarding_completed";
pub const OAUTH_STATE_KEY: &str = "cashbook.oauth_state";
pub const OAUTH_VERIFIER_KEY: &str = "cashbook.oauth_verifier";

/// Every key that belongs to an authenticated session.
pub const AUTH_KEYS: [&str; 5] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    USER_KEY,
    EXPIRES_AT_KEY,
    ONBOARDING_KEY,
];

/// Consumer-provided durable storage.
///
/// Writes are synchronous from the caller's perspective and last-writer-wins.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStorage for KeychainStore {
///     fn get(&self, key: &str) -> Result<Option<String>, Error> {
///         self.keychain.read(key).map_err(|e| Error::Storage(e.to_string()))
///     }
///     fn set(&self, key: &str, value: &str) -> Result<(), Error> { ... }
///     fn remove(&self, key: &str) -> Result<(), Error> { ... }
/// }
/// ```
pub trait SessionStorage: Send + Sync + 'static {
    /// Read a value. Missing keys are `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), Error>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object file, rewritten on every mutation.
///
/// An unreadable or corrupted file is treated as empty so that boot never
/// fails on bad local state.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("{}: {e}", parent.display())))?;
        }
        let entries = Self::load(&path);
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupted session store");
                BTreeMap::new()
            }
        }
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), Error> {
        let serialized =
            serde_json::to_string_pretty(entries).map_err(|e| Error::Storage(e.to_string()))?;
        std::fs::write(&self.path, serialized)
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_storage_get_set_remove() {
        let store = MemoryStorage::new();
        assert_eq!(store.get(USER_KEY).unwrap(), None);

        store.set(USER_KEY, "{}").unwrap();
        assert_eq!(store.get(USER_KEY).unwrap().as_deref(), Some("{}"));

        store.remove(USER_KEY).unwrap();
        store.remove(USER_KEY).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("session.json");

        let store = FileStorage::open(&path).unwrap();
        store.set(ACCESS_TOKEN_KEY, "token-1").unwrap();
        store.set(ONBOARDING_KEY, "true").unwrap();
        store.remove(ONBOARDING_KEY).unwrap();
        drop(store);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(
            reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some("token-1")
        );
        assert_eq!(reopened.get(ONBOARDING_KEY).unwrap(), None);
    }

    #[test]
    fn file_storage_treats_corrupted_file_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStorage::open(&path).unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);

        store.set(ACCESS_TOKEN_KEY, "fresh").unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("fresh"));
    }
}
