//! Authgate - Authenticated Request Gateway
//!
//! Wraps every outbound call with bearer-credential attachment, detects
//! authorization failures and refreshes the session exactly once before
//! retrying, without letting concurrent callers race into redundant refreshes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      AuthGateway                          │
//! ├──────────────────────────────────────────────────────────┤
//! │   caller ──► Dispatcher ──────────────► Transport         │
//! │                  │  (401)                   ▲             │
//! │                  ▼                          │             │
//! │          RefreshCoordinator ── refresh ─────┘             │
//! │          (single flight)                                  │
//! │                  │                                        │
//! │                  ▼                                        │
//! │          SessionController ──► SessionEvent::Invalidated  │
//! │                  │                                        │
//! │                  ▼                                        │
//! │           CredentialStore                                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single-flight refresh**: N concurrent authorization failures cause one
//!   refresh exchange; every waiter observes the same outcome
//! - **At most one retry** per request after a refresh
//! - **Terminal invalidation**: a failed refresh clears credentials and emits
//!   one `SessionEvent::Invalidated`
//! - **Pluggable transport and store**: reqwest HTTP transport, memory and
//!   file-backed credential stores

pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod refresh;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use credential::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use dispatcher::{Dispatcher, RequestAttempt, MAX_AUTH_RETRIES};
pub use error::{GatewayError, Result};
pub use gateway::{AuthGateway, GatewayStatus};
pub use refresh::{RefreshCoordinator, RefreshFailure, RefreshOutcome, RefreshStats};
pub use session::{SessionController, SessionEvent, SessionState};
pub use transport::{
    Headers, HttpTransport, Method, RequestDescriptor, Transport, TransportError,
    TransportResponse,
};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default base URL
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
