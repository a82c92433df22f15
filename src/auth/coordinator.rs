use reqwest::Url;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::refresh;
use super::store::SessionStore;
use super::types::{CredentialBundle, REFRESH_PATH};
use crate::clock::Clock;
use crate::error::{ApiError, RefreshError};
use crate::transport::{endpoint_url, HttpTransport};

type RefreshOutcome = Result<String, RefreshError>;

/// Shared refresh state; the waiter list is only non-empty while `refreshing`
#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// What a caller ended up doing after asking for a fresh token
enum Role {
    /// Token already superseded; use it without refreshing
    Reuse(String),
    /// This caller runs the refresh
    Refresher,
    /// Another caller is refreshing; wait for its outcome
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

/// Token refresh coordinator
/// Guarantees at most one refresh call in flight and fans its outcome out to
/// every request that hit a 401 meanwhile
pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    refresh_url: Url,
    refresh_timeout: Duration,
    state: Mutex<RefreshState>,
    /// Session generation, bumped on login and logout; held while the bundle is written
    session_gate: tokio::sync::Mutex<u64>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        auth_base_url: &Url,
        refresh_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let refresh_url = endpoint_url(auth_base_url, REFRESH_PATH)
            .map_err(|e| ApiError::ConfigError(format!("Invalid auth base URL: {}", e)))?;

        Ok(Self {
            store,
            transport,
            clock,
            refresh_url,
            refresh_timeout,
            state: Mutex::new(RefreshState::default()),
            session_gate: tokio::sync::Mutex::new(0),
        })
    }

    /// Get a usable access token after `rejected_token` earned a 401
    ///
    /// Starts a refresh if none is running, otherwise parks until the running
    /// one settles. If the session already holds a different token (another
    /// request refreshed in between, or the user logged in again) that token is
    /// returned without any network call.
    pub async fn refresh_or_wait(&self, rejected_token: Option<&str>) -> RefreshOutcome {
        // Check-and-set in one critical section; nothing here may await
        let role = {
            let mut state = self.lock_state();
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Role::Waiter(rx)
            } else {
                match self.store.cached_access_token() {
                    Some(current) if Some(current.as_str()) != rejected_token => {
                        Role::Reuse(current)
                    }
                    _ => {
                        state.refreshing = true;
                        Role::Refresher
                    }
                }
            }
        };

        match role {
            Role::Reuse(token) => {
                tracing::debug!("Access token already replaced, skipping refresh");
                Ok(token)
            }
            Role::Waiter(rx) => {
                tracing::debug!("Refresh in progress, queueing request");
                rx.await.unwrap_or(Err(RefreshError::Abandoned))
            }
            Role::Refresher => {
                let mut guard = SettleGuard {
                    coordinator: self,
                    settled: false,
                };
                let outcome = self.run_refresh().await;
                guard.settle(outcome.clone());
                outcome
            }
        }
    }

    /// Install a freshly logged-in session; a refresh still in flight is discarded
    pub async fn begin_session(&self, bundle: &CredentialBundle) {
        let mut generation = self.session_gate.lock().await;
        *generation = generation.wrapping_add(1);
        self.store.save(bundle).await;
    }

    /// Drop the session; a refresh still in flight is discarded
    pub async fn end_session(&self) {
        let mut generation = self.session_gate.lock().await;
        *generation = generation.wrapping_add(1);
        self.store.clear().await;
    }

    /// Whether a refresh call is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.lock_state().refreshing
    }

    /// Number of requests parked behind the outstanding refresh
    pub fn pending_requests(&self) -> usize {
        self.lock_state().waiters.len()
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        let generation = *self.session_gate.lock().await;
        let bundle = self.store.load().await.ok_or(RefreshError::NoRefreshToken)?;
        let refresh_token = bundle
            .refresh_token
            .clone()
            .ok_or(RefreshError::NoRefreshToken)?;

        let call = refresh::request_new_tokens(
            self.transport.as_ref(),
            &self.refresh_url,
            &refresh_token,
            self.refresh_timeout,
        );

        // Outer bound so a transport that ignores its timeout still releases waiters
        let tokens = match tokio::time::timeout(self.refresh_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(
                    "Token refresh timed out after {:?}",
                    self.refresh_timeout
                );
                return Err(RefreshError::Timeout);
            }
        };

        let updated = bundle.with_refreshed_tokens(tokens, self.clock.now_millis());

        let current = self.session_gate.lock().await;
        if *current != generation {
            tracing::info!("Session changed during token refresh, discarding new tokens");
            return Err(RefreshError::SessionEnded);
        }
        self.store.save(&updated).await;
        drop(current);

        updated
            .access_token()
            .map(str::to_string)
            .ok_or_else(|| RefreshError::Malformed("refreshed session has no token".to_string()))
    }

    /// Release every waiter with `outcome` and return to idle
    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock_state();
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };

        match &outcome {
            Ok(_) => tracing::info!(
                "Token refresh succeeded, releasing {} queued requests",
                waiters.len()
            ),
            Err(e) => tracing::warn!(
                "Token refresh failed ({}), rejecting {} queued requests",
                e,
                waiters.len()
            ),
        }

        for waiter in waiters {
            // Receiver gone means that request was cancelled; nothing to deliver
            let _ = waiter.send(outcome.clone());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the coordinator even if the refreshing future is dropped mid-flight
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(&mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.settle(Err(RefreshError::Abandoned));
        }
    }
}
