//! SOS Tracker Library
//!
//! Session lifecycle and live-location sync for emergency tracking.

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod foreground;
pub mod location;
pub mod logging;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use config::TrackerConfig;
use controller::{SessionController, TrackingState};
use error::TrackerError;
use foreground::{ForegroundMode, LivenessRecord, PidFileForeground};
use location::{
    LocationSource, NetworkProvider, NmeaUdpConfig, NmeaUdpProvider, PositionProvider,
    SubscriptionParams,
};
use recovery::RecoveryTrigger;
use storage::SessionStore;
use sync::{LiveLocationTransport, RestTransport, SyncClient};

/// Application state shared across commands
pub struct AppState {
    pub config: TrackerConfig,
    pub controller: Arc<SessionController>,
    pub recovery: RecoveryTrigger,
    liveness: PidFileForeground,
}

impl AppState {
    /// Wire the tracker from configuration: NMEA and network providers,
    /// REST transport, pid-file foreground mode.
    pub fn from_config(config: TrackerConfig) -> Result<Self, TrackerError> {
        let mut providers: Vec<Arc<dyn PositionProvider>> = Vec::new();
        if let Some(port) = config.nmea_port {
            providers.push(Arc::new(NmeaUdpProvider::new(NmeaUdpConfig {
                port,
                ..Default::default()
            })));
        }
        if let Some(url) = &config.geolocation_url {
            providers.push(Arc::new(NetworkProvider::new(url, config.request_timeout)?));
        }

        let transport = RestTransport::new(&config.database_url, config.request_timeout)
            .map_err(|e| TrackerError::Setup(e.to_string()))?;
        let foreground = PidFileForeground::new(config.liveness_path());

        Ok(Self::with_parts(
            config,
            providers,
            Arc::new(transport),
            Arc::new(foreground),
        ))
    }

    /// Wire the tracker from explicit collaborators.
    pub fn with_parts(
        config: TrackerConfig,
        providers: Vec<Arc<dyn PositionProvider>>,
        transport: Arc<dyn LiveLocationTransport>,
        foreground: Arc<dyn ForegroundMode>,
    ) -> Self {
        let store = Arc::new(SessionStore::open(&config.data_dir));
        let location = Arc::new(LocationSource::new(providers));
        let sync = Arc::new(SyncClient::new(transport, config.max_in_flight));
        let params = SubscriptionParams {
            min_interval: config.min_interval,
            min_distance_m: config.min_distance_m,
        };

        let controller = Arc::new(
            SessionController::new(store, location, sync, foreground, params)
                .with_clear_remote_on_stop(config.clear_remote_on_stop),
        );
        let recovery = RecoveryTrigger::new(Arc::clone(&controller));
        let liveness = PidFileForeground::new(config.liveness_path());

        Self {
            config,
            controller,
            recovery,
            liveness,
        }
    }

    /// A tracker that is already running against the same data directory,
    /// when this state is not the one running it.
    pub fn running_tracker(&self) -> Option<LivenessRecord> {
        if self.controller.state() != TrackingState::Idle {
            return None;
        }
        self.liveness.running()
    }
}
