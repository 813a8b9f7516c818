//! Authenticated request gateway
//!
//! Wires the credential store, transport, dispatcher, refresh coordinator and
//! session controller into one handle that callers issue requests through.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::GatewayConfig;
use crate::credential::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::dispatcher::{Dispatcher, RequestAttempt};
use crate::refresh::{RefreshCoordinator, RefreshStats};
use crate::session::{SessionController, SessionEvent, SessionState};
use crate::transport::{HttpTransport, RequestDescriptor, Transport, TransportResponse};
use crate::Result;

/// Gateway status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub version: String,
    pub session: SessionState,
    pub has_credential: bool,
    pub refresh_in_flight: bool,
    pub refresh: RefreshStats,
}

/// Authenticated request gateway
#[derive(Clone)]
pub struct AuthGateway {
    dispatcher: Arc<Dispatcher>,
    coordinator: RefreshCoordinator,
    session: Arc<SessionController>,
    store: Arc<dyn CredentialStore>,
}

impl AuthGateway {
    /// Create a gateway over an explicit transport and store
    pub fn new(
        config: &GatewayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let session = Arc::new(SessionController::new(store.clone()));
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            session.clone(),
            config.refresh.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            store.clone(),
            coordinator.clone(),
            config.auth.clone(),
        ));

        Self {
            dispatcher,
            coordinator,
            session,
            store,
        }
    }

    /// Create a gateway with the HTTP transport and the configured store
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::from_config(config)?);
        let store: Arc<dyn CredentialStore> = match config.credentials.storage_path {
            Some(ref path) => Arc::new(FileCredentialStore::open(path)?),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        tracing::debug!("Gateway configured for {}", config.base_url);
        Ok(Self::new(config, transport, store))
    }

    /// Send a request, refreshing the session once on authorization failure
    pub async fn dispatch(&self, request: RequestDescriptor) -> Result<TransportResponse> {
        self.dispatcher.dispatch(request).await
    }

    pub async fn dispatch_attempt(&self, attempt: RequestAttempt) -> Result<TransportResponse> {
        self.dispatcher.dispatch_attempt(attempt).await
    }

    /// Send a request and decode the JSON body
    pub async fn dispatch_json<T: DeserializeOwned>(&self, request: RequestDescriptor) -> Result<T> {
        self.dispatch(request).await?.json()
    }

    pub async fn get(&self, path: &str) -> Result<TransportResponse> {
        self.dispatch(RequestDescriptor::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<TransportResponse> {
        self.dispatch(RequestDescriptor::post(path).with_body(body)).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<TransportResponse> {
        self.dispatch(RequestDescriptor::put(path).with_body(body)).await
    }

    pub async fn patch(&self, path: &str, body: serde_json::Value) -> Result<TransportResponse> {
        self.dispatch(RequestDescriptor::patch(path).with_body(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<TransportResponse> {
        self.dispatch(RequestDescriptor::delete(path)).await
    }

    pub fn login(&self, credential: Credential) -> Result<()> {
        self.session.login(credential)
    }

    pub fn logout(&self) -> Result<()> {
        self.session.logout()
    }

    /// Session events (invalidation must be wired to the login entry point)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.store.get()
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            version: crate::VERSION.to_string(),
            session: self.session.state(),
            has_credential: !self.store.is_empty(),
            refresh_in_flight: self.coordinator.is_in_flight(),
            refresh: self.coordinator.stats(),
        }
    }
}
