//! Refresh coordinator with single-flight de-duplication
//!
//! Concurrent callers that hit an authorization failure share one refresh
//! exchange. The first caller to find the coordinator idle starts the episode
//! (leader); everyone else, the leader included, waits on the same watch
//! channel and observes the identical outcome.
//!
//! The exchange runs on its own task so that dropping any waiter, the leader
//! included, never cancels it.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::RefreshSettings;
use crate::credential::{Credential, CredentialStore};
use crate::session::SessionController;
use crate::transport::{Headers, RequestDescriptor, Transport, TransportError};

/// Result of a refresh episode, shared by every waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Credential),
    Failed(RefreshFailure),
}

/// Why a refresh did not produce a credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("refresh rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("refresh transport failure: {0}")]
    Transport(TransportError),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("refresh task ended without an outcome")]
    Aborted,

    #[error("session already invalidated")]
    SessionInvalidated,
}

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// At most one `InFlight` exists per coordinator
enum RefreshState {
    Idle,
    InFlight(OutcomeReceiver),
}

/// Episode counters
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    episodes: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    followers: AtomicU64,
}

impl RefreshMetrics {
    pub fn snapshot(&self) -> RefreshStats {
        RefreshStats {
            episodes: self.episodes.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RefreshMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStats {
    /// Refresh exchanges started
    pub episodes: u64,
    pub successes: u64,
    pub failures: u64,
    /// Callers that joined an episode already in flight
    pub followers: u64,
}

struct Inner {
    state: Mutex<RefreshState>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    session: Arc<SessionController>,
    settings: RefreshSettings,
    metrics: RefreshMetrics,
}

/// Refresh coordinator
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        session: Arc<SessionController>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::Idle),
                transport,
                store,
                session,
                settings,
                metrics: RefreshMetrics::default(),
            }),
        }
    }

    /// Refresh the access credential.
    ///
    /// `rejected` is the credential the failed request carried. If the store
    /// already holds something else, that credential is returned without a
    /// new exchange.
    pub async fn refresh(&self, rejected: Option<&Credential>) -> RefreshOutcome {
        let receiver = {
            let mut state = self.inner.state.lock();
            let in_flight = match &*state {
                RefreshState::InFlight(receiver) => Some(receiver.clone()),
                RefreshState::Idle => None,
            };

            match in_flight {
                Some(receiver) => {
                    self.inner.metrics.followers.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Joining refresh already in flight");
                    receiver
                }
                None => {
                    if self.inner.session.is_invalidated() {
                        return RefreshOutcome::Failed(RefreshFailure::SessionInvalidated);
                    }
                    if let Some(current) = self.inner.store.get() {
                        if rejected != Some(&current) {
                            tracing::debug!("Credential already replaced, skipping refresh");
                            return RefreshOutcome::Refreshed(current);
                        }
                    }

                    let (sender, receiver) = watch::channel(None);
                    *state = RefreshState::InFlight(receiver.clone());
                    self.inner.metrics.episodes.fetch_add(1, Ordering::Relaxed);
                    self.inner.session.begin_refresh();

                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.run_episode(sender).await });
                    receiver
                }
            }
        };

        wait_for_outcome(receiver).await
    }

    /// Whether an episode is currently in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(&*self.inner.state.lock(), RefreshState::InFlight(_))
    }

    pub fn stats(&self) -> RefreshStats {
        self.inner.metrics.snapshot()
    }
}

async fn wait_for_outcome(mut receiver: OutcomeReceiver) -> RefreshOutcome {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(settled) => settled.clone(),
        // sender dropped without publishing
        Err(_) => None,
    };
    outcome.unwrap_or(RefreshOutcome::Failed(RefreshFailure::Aborted))
}

/// Returns the coordinator to `Idle` however the episode task ends
struct EpisodeGuard<'a> {
    state: &'a Mutex<RefreshState>,
}

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = RefreshState::Idle;
    }
}

impl Inner {
    async fn run_episode(self: Arc<Self>, sender: watch::Sender<Option<RefreshOutcome>>) {
        let episode = EpisodeGuard { state: &self.state };
        tracing::info!("Refreshing access credential");

        let outcome = match AssertUnwindSafe(self.exchange()).catch_unwind().await {
            Ok(Ok(credential)) => RefreshOutcome::Refreshed(credential),
            Ok(Err(failure)) => RefreshOutcome::Failed(failure),
            Err(_) => {
                tracing::error!("Refresh exchange panicked");
                RefreshOutcome::Failed(RefreshFailure::Aborted)
            }
        };

        let outcome = self.settle(outcome);
        match &outcome {
            RefreshOutcome::Refreshed(_) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
            }
            RefreshOutcome::Failed(failure) => {
                tracing::warn!("Refresh failed: {}", failure);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        drop(episode);
        let _ = sender.send(Some(outcome));
    }

    /// Hand the outcome to the session. A panic while settling (e.g. in a
    /// credential store) still invalidates the session.
    fn settle(&self, outcome: RefreshOutcome) -> RefreshOutcome {
        let settled = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.session.on_refresh_settled(outcome)
        }));
        match settled {
            Ok(settled) => settled,
            Err(_) => {
                tracing::error!("Settling refresh outcome panicked");
                let aborted = RefreshOutcome::Failed(RefreshFailure::Aborted);
                let retry = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    self.session.on_refresh_settled(aborted.clone())
                }));
                if retry.is_err() {
                    tracing::error!("Credential store panicked while clearing");
                }
                aborted
            }
        }
    }

    /// One exchange against the refresh endpoint. No access credential is
    /// attached; the refresh token travels with the transport.
    async fn exchange(&self) -> Result<Credential, RefreshFailure> {
        let mut request = RequestDescriptor::new(self.settings.method, self.settings.path.clone());
        request.headers = self.settings.headers.clone();
        let response = self
            .transport
            .send(&request, &Headers::new())
            .await
            .map_err(|e| match e {
                TransportError::Status { status, .. } => RefreshFailure::Rejected { status },
                other => RefreshFailure::Transport(other),
            })?;

        if !(200..300).contains(&response.status) {
            return Err(RefreshFailure::Rejected {
                status: response.status,
            });
        }

        let body: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
        let token = body
            .pointer(&self.settings.token_pointer)
            .and_then(serde_json::Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                RefreshFailure::Malformed(format!(
                    "no token at {}",
                    self.settings.token_pointer
                ))
            })?;

        Ok(Credential::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemoryCredentialStore;
    use crate::session::SessionEvent;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Refresh endpoint that blocks until released
    struct GatedRefresh {
        calls: AtomicUsize,
        gate: Notify,
        reply: std::result::Result<TransportResponse, TransportError>,
        panics: bool,
    }

    impl GatedRefresh {
        fn new(reply: std::result::Result<TransportResponse, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                reply,
                panics: false,
            })
        }

        /// Panics instead of answering once released
        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                reply: Err(TransportError::Timeout),
                panics: true,
            })
        }
    }

    #[async_trait]
    impl Transport for GatedRefresh {
        async fn send(
            &self,
            request: &RequestDescriptor,
            headers: &Headers,
        ) -> std::result::Result<TransportResponse, TransportError> {
            assert_eq!(request.path, "/auth/refresh");
            assert!(headers.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.panics {
                panic!("refresh endpoint blew up");
            }
            self.reply.clone()
        }
    }

    /// Store whose writes panic
    struct ExplodingStore(MemoryCredentialStore);

    impl CredentialStore for ExplodingStore {
        fn get(&self) -> Option<Credential> {
            self.0.get()
        }

        fn set(&self, _credential: Credential) -> crate::Result<()> {
            panic!("disk on fire");
        }

        fn clear(&self) -> crate::Result<()> {
            self.0.clear()
        }
    }

    fn setup(
        transport: Arc<GatedRefresh>,
    ) -> (RefreshCoordinator, Arc<MemoryCredentialStore>, Arc<SessionController>) {
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new("old")));
        let session = Arc::new(SessionController::new(store.clone()));
        let coordinator = RefreshCoordinator::new(
            transport,
            store.clone(),
            session.clone(),
            RefreshSettings::default(),
        );
        (coordinator, store, session)
    }

    async fn wait_until_called(transport: &GatedRefresh) {
        for _ in 0..200 {
            if transport.calls.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh endpoint never called");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_followers_share_one_exchange() {
        let transport = GatedRefresh::new(Ok(TransportResponse::json_body(
            200,
            &serde_json::json!({"access_token": "new"}),
        )));
        let (coordinator, store, _) = setup(transport.clone());
        let old = Credential::new("old");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let old = old.clone();
            handles.push(tokio::spawn(async move { coordinator.refresh(Some(&old)).await }));
        }

        wait_until_called(&transport).await;
        while coordinator.stats().followers < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(coordinator.is_in_flight());
        transport.gate.notify_one();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                RefreshOutcome::Refreshed(Credential::new("new"))
            );
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().unwrap().expose(), "new");
        assert!(!coordinator.is_in_flight());

        let stats = coordinator.stats();
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.followers, 7);
    }

    #[tokio::test]
    async fn test_replaced_credential_skips_exchange() {
        let transport = GatedRefresh::new(Err(TransportError::Timeout));
        let (coordinator, _, _) = setup(transport.clone());

        let outcome = coordinator.refresh(Some(&Credential::new("older"))).await;
        assert_eq!(outcome, RefreshOutcome::Refreshed(Credential::new("old")));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.stats().episodes, 0);
    }

    #[tokio::test]
    async fn test_malformed_response_invalidates_session() {
        let transport = GatedRefresh::new(Ok(TransportResponse::json_body(
            200,
            &serde_json::json!({"token": "wrong-field"}),
        )));
        let (coordinator, store, session) = setup(transport.clone());

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&transport).await;
        transport.gate.notify_one();

        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Failed(RefreshFailure::Malformed(_))
        ));
        assert!(store.get().is_none());
        assert!(session.is_invalidated());

        // terminal: no further exchange until login
        let again = coordinator.refresh(None).await;
        assert_eq!(again, RefreshOutcome::Failed(RefreshFailure::SessionInvalidated));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_status_and_timeout_map_to_failures() {
        let rejected = GatedRefresh::new(Err(TransportError::Status {
            status: 403,
            body: "revoked".to_string(),
        }));
        let (coordinator, _, _) = setup(rejected.clone());
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&rejected).await;
        rejected.gate.notify_one();
        assert_eq!(
            task.await.unwrap(),
            RefreshOutcome::Failed(RefreshFailure::Rejected { status: 403 })
        );

        let timeout = GatedRefresh::new(Err(TransportError::Timeout));
        let (coordinator, _, _) = setup(timeout.clone());
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&timeout).await;
        timeout.gate.notify_one();
        assert_eq!(
            task.await.unwrap(),
            RefreshOutcome::Failed(RefreshFailure::Transport(TransportError::Timeout))
        );
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_cancel_refresh() {
        let transport = GatedRefresh::new(Ok(TransportResponse::json_body(
            200,
            &serde_json::json!({"access_token": "survivor"}),
        )));
        let (coordinator, store, _) = setup(transport.clone());

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&transport).await;
        leader.abort();
        let _ = leader.await;

        assert!(coordinator.is_in_flight());
        transport.gate.notify_one();

        for _ in 0..200 {
            if !coordinator.is_in_flight() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.get().unwrap().expose(), "survivor");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_logout_during_refresh_discards_credential() {
        let transport = GatedRefresh::new(Ok(TransportResponse::json_body(
            200,
            &serde_json::json!({"access_token": "resurrected"}),
        )));
        let (coordinator, store, session) = setup(transport.clone());
        let mut events = session.subscribe();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&transport).await;
        session.logout().unwrap();
        transport.gate.notify_one();

        assert_eq!(
            task.await.unwrap(),
            RefreshOutcome::Failed(RefreshFailure::SessionInvalidated)
        );
        assert!(store.get().is_none());
        assert!(session.is_invalidated());
        assert!(!coordinator.is_in_flight());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
        assert!(events.try_recv().is_err());

        let stats = coordinator.stats();
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_exchange_aborts_every_waiter() {
        let transport = GatedRefresh::panicking();
        let (coordinator, store, session) = setup(transport.clone());
        let mut events = session.subscribe();
        let old = Credential::new("old");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            let old = old.clone();
            handles.push(tokio::spawn(async move { coordinator.refresh(Some(&old)).await }));
        }

        wait_until_called(&transport).await;
        while coordinator.stats().followers < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.gate.notify_one();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                RefreshOutcome::Failed(RefreshFailure::Aborted)
            );
        }
        assert!(!coordinator.is_in_flight());
        assert!(store.get().is_none());
        assert!(session.is_invalidated());

        let mut invalidations = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Invalidated { .. }) {
                invalidations += 1;
            }
        }
        assert_eq!(invalidations, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_store_still_settles_episode() {
        let transport = GatedRefresh::new(Ok(TransportResponse::json_body(
            200,
            &serde_json::json!({"access_token": "new"}),
        )));
        let store: Arc<dyn CredentialStore> = Arc::new(ExplodingStore(
            MemoryCredentialStore::with_credential(Credential::new("old")),
        ));
        let session = Arc::new(SessionController::new(store.clone()));
        let mut events = session.subscribe();
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            session.clone(),
            RefreshSettings::default(),
        );

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(Some(&Credential::new("old"))).await })
        };
        wait_until_called(&transport).await;
        transport.gate.notify_one();

        assert_eq!(
            task.await.unwrap(),
            RefreshOutcome::Failed(RefreshFailure::Aborted)
        );
        assert!(!coordinator.is_in_flight());
        assert!(session.is_invalidated());
        assert!(store.get().is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated { .. }
        ));

        // later failures are refused as invalidated instead of aborting forever
        assert_eq!(
            coordinator.refresh(None).await,
            RefreshOutcome::Failed(RefreshFailure::SessionInvalidated)
        );
    }
}
