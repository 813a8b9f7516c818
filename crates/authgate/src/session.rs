//! Session controller
//!
//! Reacts to refresh outcomes and owns the session-level state machine:
//!
//! ```text
//! Authenticated --auth failure--> Refreshing --success--> Authenticated
//!                                 Refreshing --failure--> Invalidated (until login)
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::credential::{Credential, CredentialStore};
use crate::refresh::{RefreshFailure, RefreshOutcome};
use crate::Result;

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Requests carry a credential the server is expected to accept
    Authenticated,
    /// A refresh exchange is in flight
    Refreshing,
    /// Refresh failed or the user logged out; terminal until the next login
    Invalidated,
}

/// Events the embedding application observes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    /// Redirect to the login entry point
    Invalidated { reason: String },
    LoggedOut,
}

/// Session controller
pub struct SessionController {
    state: RwLock<SessionState>,
    store: Arc<dyn CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(SessionState::Authenticated),
            store,
            events,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_invalidated(&self) -> bool {
        self.state() == SessionState::Invalidated
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Mark the start of a refresh episode
    pub(crate) fn begin_refresh(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Authenticated {
            *state = SessionState::Refreshing;
        }
    }

    /// Apply the settled outcome of a refresh episode and return the outcome
    /// waiters observe.
    ///
    /// Every store write happens under the state lock, so a concurrent logout
    /// either precedes the install (the credential is discarded and waiters
    /// see `SessionInvalidated`) or follows it and clears it. On failure the
    /// store is cleared and a single `Invalidated` event is emitted; repeated
    /// failures while already invalidated emit nothing.
    pub fn on_refresh_settled(&self, outcome: RefreshOutcome) -> RefreshOutcome {
        match outcome {
            RefreshOutcome::Refreshed(credential) => {
                {
                    let mut state = self.state.write();
                    if *state == SessionState::Invalidated {
                        tracing::debug!("Refresh settled after logout, discarding credential");
                        return RefreshOutcome::Failed(RefreshFailure::SessionInvalidated);
                    }
                    if let Err(e) = self.store.set(credential.clone()) {
                        tracing::warn!("Refreshed credential not persisted: {}", e);
                    }
                    *state = SessionState::Authenticated;
                }
                tracing::info!("Session refreshed");
                let _ = self.events.send(SessionEvent::Refreshed);
                RefreshOutcome::Refreshed(credential)
            }
            RefreshOutcome::Failed(reason) => {
                let mut state = self.state.write();
                if *state != SessionState::Invalidated {
                    *state = SessionState::Invalidated;
                    tracing::warn!("Session invalidated: {}", reason);
                    let _ = self.events.send(SessionEvent::Invalidated {
                        reason: reason.to_string(),
                    });
                }
                if let Err(e) = self.store.clear() {
                    tracing::error!("Failed to clear credential store: {}", e);
                }
                RefreshOutcome::Failed(reason)
            }
        }
    }

    /// Install a fresh credential and (re)establish the session
    pub fn login(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.write();
        self.store.set(credential)?;
        *state = SessionState::Authenticated;
        drop(state);
        tracing::info!("Session established");
        let _ = self.events.send(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Clear the credential and end the session
    pub fn logout(&self) -> Result<()> {
        let mut state = self.state.write();
        *state = SessionState::Invalidated;
        self.store.clear()?;
        drop(state);
        tracing::info!("Session ended by logout");
        let _ = self.events.send(SessionEvent::LoggedOut);
        Ok(())
    }
}
