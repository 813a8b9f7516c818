//! Access credential and the store that owns it
//!
//! The store is the only place the current access credential lives. The
//! dispatcher reads a snapshot per request; only the session controller
//! writes to it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Result;

/// Short-lived access token attached to outgoing requests
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    token: String,

    /// When the credential was installed
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
        }
    }

    /// Raw token value
    pub fn expose(&self) -> &str {
        &self.token
    }

    /// Header value for the given scheme (`"Bearer abc"`, or `"abc"` with an empty scheme)
    pub fn header_value(&self, scheme: &str) -> String {
        if scheme.is_empty() {
            self.token.clone()
        } else {
            format!("{} {}", scheme, self.token)
        }
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for Credential {}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Holder of the current access credential
pub trait CredentialStore: Send + Sync {
    /// Snapshot of the current credential
    fn get(&self) -> Option<Credential>;

    /// Install a credential, replacing any previous one
    fn set(&self, credential: Credential) -> Result<()>;

    /// Drop the credential
    fn clear(&self) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.get().is_none()
    }
}

/// Process-local credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    fn set(&self, credential: Credential) -> Result<()> {
        *self.current.write() = Some(credential);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.current.write() = None;
        Ok(())
    }
}

/// Credential store mirrored to a JSON file
///
/// The in-memory snapshot is updated before the file is touched, so a failed
/// write never leaves dispatch reading a stale token.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    current: RwLock<Option<Credential>>,
}

impl FileCredentialStore {
    /// Open the store, loading the persisted credential if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let credential: Credential = serde_json::from_str(&content)?;
            tracing::info!("Loaded credential from {}", path.display());
            Some(credential)
        } else {
            None
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    fn set(&self, credential: Credential) -> Result<()> {
        let json = serde_json::to_string(&credential)?;
        *self.current.write() = Some(credential);
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.current.write() = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
