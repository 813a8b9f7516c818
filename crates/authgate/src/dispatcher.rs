//! Request dispatcher
//!
//! Attaches the current access credential, delegates to the transport and,
//! on an authorization failure, hands over to the refresh coordinator before
//! re-dispatching at most once.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::credential::{Credential, CredentialStore};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::transport::{Headers, RequestDescriptor, Transport, TransportError, TransportResponse};
use crate::{GatewayError, Result};

/// Retries allowed after a refresh
pub const MAX_AUTH_RETRIES: u8 = 1;

/// A dispatched call and how many post-refresh retries it has used
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    pub id: Uuid,
    pub request: RequestDescriptor,
    retries: u8,
}

impl RequestAttempt {
    pub fn new(request: RequestDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            retries: 0,
        }
    }

    /// An attempt that has already used its retry
    pub fn retried(request: RequestDescriptor) -> Self {
        Self {
            retries: MAX_AUTH_RETRIES,
            ..Self::new(request)
        }
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn can_retry(&self) -> bool {
        self.retries < MAX_AUTH_RETRIES
    }

    fn mark_retried(&mut self) {
        self.retries = (self.retries + 1).min(MAX_AUTH_RETRIES);
    }
}

/// Request dispatcher
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    auth: AuthSettings,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
        auth: AuthSettings,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
            auth,
        }
    }

    pub async fn dispatch(&self, request: RequestDescriptor) -> Result<TransportResponse> {
        self.dispatch_attempt(RequestAttempt::new(request)).await
    }

    #[tracing::instrument(skip_all, fields(attempt = %attempt.id, request = %attempt.request))]
    pub async fn dispatch_attempt(&self, mut attempt: RequestAttempt) -> Result<TransportResponse> {
        loop {
            let credential = self.store.get();
            let headers = self.headers_for(credential.as_ref());

            let failure = match self.transport.send(&attempt.request, &headers).await {
                Ok(response) => return Ok(response),
                Err(failure) if self.is_authorization_failure(&failure) => failure,
                Err(failure) => return Err(GatewayError::Transport(failure)),
            };

            if !attempt.can_retry() {
                tracing::warn!("Authorization failed after retry, giving up");
                return Err(GatewayError::Unauthorized(failure));
            }

            match self.coordinator.refresh(credential.as_ref()).await {
                RefreshOutcome::Refreshed(_) => {
                    tracing::debug!("Retrying with refreshed credential");
                    attempt.mark_retried();
                }
                RefreshOutcome::Failed(reason) => {
                    return Err(GatewayError::SessionInvalidated {
                        original: failure,
                        reason,
                    });
                }
            }
        }
    }

    /// Headers carrying the credential snapshot, if any
    pub fn headers_for(&self, credential: Option<&Credential>) -> Headers {
        let mut headers = Headers::new();
        if let Some(credential) = credential {
            headers.insert(
                self.auth.header.clone(),
                credential.header_value(&self.auth.scheme),
            );
        }
        headers
    }

    fn is_authorization_failure(&self, failure: &TransportError) -> bool {
        failure
            .status()
            .map(|status| self.auth.is_unauthorized(status))
            .unwrap_or(false)
    }
}
