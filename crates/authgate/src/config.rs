//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::transport::{Headers, Method};
use crate::{GatewayError, DEFAULT_BASE_URL};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL every request path is joined onto
    pub base_url: String,

    /// Install the log subscriber (the binary's `--verbose` always does)
    pub tracing: bool,

    /// How credentials are attached and recognised as rejected
    pub auth: AuthSettings,

    /// Refresh endpoint
    pub refresh: RefreshSettings,

    /// Transport configuration
    pub transport: TransportSettings,

    /// Credential persistence
    pub credentials: CredentialSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            tracing: true,
            auth: AuthSettings::default(),
            refresh: RefreshSettings::default(),
            transport: TransportSettings::default(),
            credentials: CredentialSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the refresh endpoint path
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh.path = path.into();
        self
    }

    /// Set the request timeout
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.transport.timeout_secs = secs;
        self
    }

    /// Persist credentials to the given file
    pub fn with_credential_path(mut self, path: impl Into<String>) -> Self {
        self.credentials.storage_path = Some(path.into());
        self
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.transport.timeout_secs)
    }

    /// Check the configuration for values the gateway cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("base_url is empty".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| GatewayError::InvalidConfig(format!("base_url: {}", e)))?;
        if self.refresh.path.trim().is_empty() {
            return Err(GatewayError::InvalidConfig(
                "refresh.path is empty".to_string(),
            ));
        }
        if !self.refresh.token_pointer.is_empty() && !self.refresh.token_pointer.starts_with('/')
        {
            return Err(GatewayError::InvalidConfig(format!(
                "refresh.token_pointer must start with '/': {}",
                self.refresh.token_pointer
            )));
        }
        if self.auth.unauthorized_statuses.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "auth.unauthorized_statuses is empty".to_string(),
            ));
        }
        if self.transport.timeout_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "transport.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a file (TOML when the extension is `.toml`, JSON otherwise)
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build a configuration from `AUTHGATE_*` environment variables (a `.env` file is honoured)
    pub fn from_env() -> crate::Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("AUTHGATE_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(path) = std::env::var("AUTHGATE_REFRESH_PATH") {
            config.refresh.path = path;
        }
        if let Ok(path) = std::env::var("AUTHGATE_CREDENTIAL_PATH") {
            config.credentials.storage_path = Some(path);
        }
        if let Ok(secs) = std::env::var("AUTHGATE_TIMEOUT_SECS") {
            config.transport.timeout_secs = secs.parse().map_err(|_| {
                GatewayError::InvalidConfig(format!("AUTHGATE_TIMEOUT_SECS: {}", secs))
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|ext| ext == "toml").unwrap_or(false)
}

/// Credential attachment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Header the access credential is written to
    pub header: String,

    /// Scheme prefix, e.g. "Bearer" (empty sends the bare token)
    pub scheme: String,

    /// Statuses that mean "credential invalid or expired"
    pub unauthorized_statuses: Vec<u16>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            header: "Authorization".to_string(),
            scheme: "Bearer".to_string(),
            unauthorized_statuses: vec![401],
        }
    }
}

impl AuthSettings {
    pub fn is_unauthorized(&self, status: u16) -> bool {
        self.unauthorized_statuses.contains(&status)
    }
}

/// Refresh endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// HTTP method of the refresh call
    pub method: Method,

    /// Path of the refresh endpoint, relative to `base_url`
    pub path: String,

    /// JSON pointer to the new access token in the response body
    pub token_pointer: String,

    /// Static headers sent with the refresh call (e.g. a `Cookie` carrying the refresh token)
    pub headers: Headers,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            method: Method::Post,
            path: "/auth/refresh".to_string(),
            token_pointer: "/access_token".to_string(),
            headers: Headers::new(),
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Keep cookies between requests (carries the refresh token)
    pub cookie_store: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            cookie_store: true,
        }
    }
}

/// Credential persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// File the access credential is mirrored to (memory only if unset)
    pub storage_path: Option<String>,
}
