//! Error taxonomy surfaced to callers of the tracker.

use crate::config::ConfigError;
use crate::location::LocationError;
use crate::session::InvalidSessionError;
use crate::storage::PersistenceError;

/// Tracker errors
///
/// Publish failures are absent on purpose: the sync client absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    InvalidSession(#[from] InvalidSessionError),

    #[error("{0}")]
    PermissionDenied(LocationError),

    #[error("Location unavailable: {0}")]
    Location(LocationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl From<LocationError> for TrackerError {
    fn from(e: LocationError) -> Self {
        match e {
            LocationError::PermissionDenied { .. } => TrackerError::PermissionDenied(e),
            other => TrackerError::Location(other),
        }
    }
}

impl TrackerError {
    /// Short machine-readable kind, used in command results.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::InvalidSession(_) => "invalid_session",
            TrackerError::PermissionDenied(_) => "permission_denied",
            TrackerError::Location(_) => "location_unavailable",
            TrackerError::Persistence(_) => "persistence",
            TrackerError::Config(_) => "config",
            TrackerError::Setup(_) => "setup",
        }
    }
}
