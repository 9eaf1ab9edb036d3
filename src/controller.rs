//! Session Controller
//!
//! Owns the single authoritative copy of the tracking state and drives the
//! session lifecycle:
//!
//! ```text
//! Idle --start/resume--> Active --stop--> Stopping --> Idle
//!                        Active --sample--> Active (forwarded to sync)
//! ```
//!
//! The store is a passive mirror written only from here. Position samples
//! arrive on a channel and are handed to the sync client by a pump task;
//! the pump never waits for a publish.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::TrackerError;
use crate::foreground::ForegroundMode;
use crate::location::{LocationSource, PositionSample, ProviderSubscription, SubscriptionParams};
use crate::session::{SessionRequest, TrackingSession};
use crate::storage::SessionStore;
use crate::sync::{SyncClient, SyncStatsSnapshot};

/// Capacity of the sample queue between providers and the pump.
const SAMPLE_QUEUE_CAPACITY: usize = 64;

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    Idle,
    Active,
    Stopping,
}

struct ActiveTracking {
    session: TrackingSession,
    subscription: ProviderSubscription,
    pump: JoinHandle<()>,
    stats_at_start: SyncStatsSnapshot,
}

impl ActiveTracking {
    /// Release providers and end the pump. In-flight publishes keep running.
    async fn release(mut self, location: &LocationSource) {
        self.pump.abort();
        location.unsubscribe(&mut self.subscription).await;
    }
}

/// How the store compared with what this controller is tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCheck {
    /// The store holds the session being tracked.
    Unchanged,
    /// Another session was written; tracking now follows it.
    Switched { sos_id: String },
    /// The store was cleared; tracking has stopped.
    Cleared,
}

enum Phase {
    Idle,
    Active(ActiveTracking),
    Stopping,
}

/// Whether `activate` writes the session through to the store.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Persist {
    Write,
    AlreadyStored,
}

/// Session lifecycle state machine.
pub struct SessionController {
    store: Arc<SessionStore>,
    location: Arc<LocationSource>,
    sync: Arc<SyncClient>,
    foreground: Arc<dyn ForegroundMode>,
    params: SubscriptionParams,
    clear_remote_on_stop: bool,
    phase: Mutex<Phase>,
    state_tx: watch::Sender<TrackingState>,
    remote_cleanup: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        store: Arc<SessionStore>,
        location: Arc<LocationSource>,
        sync: Arc<SyncClient>,
        foreground: Arc<dyn ForegroundMode>,
        params: SubscriptionParams,
    ) -> Self {
        let (state_tx, _) = watch::channel(TrackingState::Idle);
        Self {
            store,
            location,
            sync,
            foreground,
            params,
            clear_remote_on_stop: false,
            phase: Mutex::new(Phase::Idle),
            state_tx,
            remote_cleanup: Mutex::new(Vec::new()),
        }
    }

    /// Delete the remote location record on `stop()`.
    pub fn with_clear_remote_on_stop(mut self, enabled: bool) -> Self {
        self.clear_remote_on_stop = enabled;
        self
    }

    /// Start tracking a new session.
    ///
    /// Invalid input is rejected before anything is written. Starting while
    /// another session is active reconfigures the running loop; starting
    /// the session that is already active changes nothing.
    pub async fn start(&self, request: SessionRequest) -> Result<(), TrackerError> {
        let session = TrackingSession::from_request(request)?;
        self.activate(session, Persist::Write).await
    }

    /// Validate and persist a session for the tracker running in another
    /// process to pick up. Nothing is subscribed here.
    pub fn hand_off(&self, request: SessionRequest) -> Result<TrackingSession, TrackerError> {
        let session = TrackingSession::from_request(request)?;
        self.store.save(&session)?;
        info!(sos_id = %session.sos_id, "SOS session handed to running tracker");
        Ok(session)
    }

    /// Resume the persisted session, if there is one.
    ///
    /// Returns whether a session is now active. A session that is already
    /// running is left untouched, so repeated resumes never stack
    /// subscriptions.
    pub async fn resume(&self) -> Result<bool, TrackerError> {
        match self.store.load()? {
            Some(session) => {
                info!(sos_id = %session.sos_id, "Resuming persisted SOS session");
                self.activate(session, Persist::AlreadyStored).await?;
                Ok(true)
            }
            None => {
                debug!("No persisted SOS session to resume");
                Ok(false)
            }
        }
    }

    /// Stop tracking and forget the session.
    ///
    /// Safe at any time and idempotent. Does not wait for in-flight
    /// publishes. The store is cleared even when nothing was running in
    /// this process.
    pub async fn stop(&self) -> Result<(), TrackerError> {
        let mut phase = self.phase.lock().await;
        let previous = std::mem::replace(&mut *phase, Phase::Stopping);
        self.set_state(TrackingState::Stopping);

        if let Phase::Active(active) = previous {
            let session = active.session.clone();
            let stats = self.sync.stats().since(&active.stats_at_start);
            active.release(&self.location).await;

            if self.clear_remote_on_stop {
                let cleanup = self.sync.clear_remote(&session.user_id, &session.identity_token);
                self.remote_cleanup.lock().await.push(cleanup);
            }

            info!(
                sos_id = %session.sos_id,
                dispatched = stats.dispatched,
                succeeded = stats.succeeded,
                failed = stats.failed,
                dropped = stats.dropped,
                "SOS tracking stopped"
            );
        }
        self.foreground.exit();

        let cleared = self.store.clear();

        *phase = Phase::Idle;
        self.set_state(TrackingState::Idle);

        cleared.map_err(|e| {
            error!(error = %e, "Failed to clear persisted session");
            TrackerError::from(e)
        })
    }

    /// Release providers without forgetting the session, for process
    /// teardown. The next `resume()` picks the session up again.
    pub async fn shutdown(&self) {
        let mut phase = self.phase.lock().await;
        if let Phase::Active(active) = std::mem::replace(&mut *phase, Phase::Idle) {
            info!(sos_id = %active.session.sos_id, "Tracker shutting down, session kept for recovery");
            active.release(&self.location).await;
            self.foreground.exit();
        }
        self.set_state(TrackingState::Idle);
    }

    /// Make this controller follow the store, which another process may
    /// have rewritten or cleared.
    pub async fn reconcile(&self) -> Result<StoreCheck, TrackerError> {
        let Some(stored) = self.store.load()? else {
            if self.state() != TrackingState::Idle {
                info!("Persisted session cleared, stopping");
            }
            self.stop().await?;
            return Ok(StoreCheck::Cleared);
        };

        if self.active_session().await.as_ref() == Some(&stored) {
            return Ok(StoreCheck::Unchanged);
        }

        info!(sos_id = %stored.sos_id, "Persisted session changed, following it");
        let sos_id = stored.sos_id.clone();
        self.activate(stored, Persist::AlreadyStored).await?;
        Ok(StoreCheck::Switched { sos_id })
    }

    /// Wait up to `limit` for remote cleanup started by `stop()`, so it is
    /// not cut off when the process exits.
    pub async fn finish_remote_cleanup(&self, limit: Duration) {
        let pending = std::mem::take(&mut *self.remote_cleanup.lock().await);
        if pending.is_empty() {
            return;
        }

        let all = async {
            for task in pending {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(limit, all).await.is_err() {
            warn!(?limit, "Remote cleanup still running at exit");
        }
    }

    /// Whether a session is considered active, judged from the store.
    ///
    /// This is an approximation: it reports what was persisted, not whether
    /// fixes are flowing.
    pub fn status(&self) -> Result<bool, TrackerError> {
        Ok(self.store.has_session_id()?)
    }

    /// Live lifecycle state of this controller.
    pub fn state(&self) -> TrackingState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TrackingState> {
        self.state_tx.subscribe()
    }

    /// The session currently being tracked by this process.
    pub async fn active_session(&self) -> Option<TrackingSession> {
        match &*self.phase.lock().await {
            Phase::Active(active) => Some(active.session.clone()),
            _ => None,
        }
    }

    /// Publish counts for the session currently being tracked.
    pub async fn session_stats(&self) -> Option<SyncStatsSnapshot> {
        match &*self.phase.lock().await {
            Phase::Active(active) => Some(self.sync.stats().since(&active.stats_at_start)),
            _ => None,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn location(&self) -> &LocationSource {
        &self.location
    }

    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    async fn activate(&self, session: TrackingSession, persist: Persist) -> Result<(), TrackerError> {
        let mut phase = self.phase.lock().await;

        if let Phase::Active(active) = &*phase {
            if active.session == session {
                debug!(sos_id = %session.sos_id, "Session already active");
                return Ok(());
            }
        }

        if persist == Persist::Write {
            self.store.save(&session)?;
        }

        if let Phase::Active(previous) = std::mem::replace(&mut *phase, Phase::Idle) {
            info!(
                from = %previous.session.sos_id,
                to = %session.sos_id,
                "Reconfiguring tracking for new session"
            );
            previous.release(&self.location).await;
        }

        let stats_at_start = self.sync.stats();
        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_QUEUE_CAPACITY);
        let subscription = match self.location.subscribe(self.params, sample_tx).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(sos_id = %session.sos_id, error = %e, "Location subscription failed, tracking not started");
                self.foreground.exit();
                self.set_state(TrackingState::Idle);
                return Err(e.into());
            }
        };

        self.foreground.enter(&session);

        let pump = tokio::spawn(pump_samples(
            sample_rx,
            Arc::clone(&self.sync),
            session.clone(),
        ));

        info!(
            sos_id = %session.sos_id,
            providers = ?subscription.providers(),
            "SOS tracking active"
        );

        *phase = Phase::Active(ActiveTracking {
            session,
            subscription,
            pump,
            stats_at_start,
        });
        self.set_state(TrackingState::Active);
        Ok(())
    }

    fn set_state(&self, state: TrackingState) {
        self.state_tx.send_replace(state);
    }
}

/// Forward every sample to the sync client. Ends when the providers are
/// released and the queue drains.
async fn pump_samples(
    mut samples: mpsc::Receiver<PositionSample>,
    sync: Arc<SyncClient>,
    session: TrackingSession,
) {
    while let Some(sample) = samples.recv().await {
        debug!(
            sos_id = %session.sos_id,
            provider = %sample.provider,
            lat = sample.latitude,
            lon = sample.longitude,
            "Position sample"
        );
        if !sync.publish(&session.user_id, &session.identity_token, &session.sos_id, &sample) {
            warn!(sos_id = %session.sos_id, "Sample not published");
        }
    }
    debug!(sos_id = %session.sos_id, "Sample pump finished");
}
