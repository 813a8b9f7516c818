//! Error types for the gateway

use thiserror::Error;

use crate::refresh::RefreshFailure;
use crate::transport::TransportError;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Non-authorization failure, passed through untouched
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Authorization failure that may not trigger another refresh
    #[error("Unauthorized: {0}")]
    Unauthorized(TransportError),

    /// The refresh failed and the session is gone
    #[error("Session invalidated ({reason}): {original}")]
    SessionInvalidated {
        original: TransportError,
        reason: RefreshFailure,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether this error means the user has to log in again
    pub fn is_session_invalidated(&self) -> bool {
        matches!(self, GatewayError::SessionInvalidated { .. })
    }

    /// Status code of the underlying transport failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Transport(e) | GatewayError::Unauthorized(e) => e.status(),
            GatewayError::SessionInvalidated { original, .. } => original.status(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(e: toml::de::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(e: toml::ser::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
