//! Commands Module
//!
//! The external command surface: start, stop, status and the boot signal.
//! Results are serializable so any front end (CLI, IPC bridge) can relay them.

use serde::Serialize;
use tracing::{info, error, debug};

use crate::error::TrackerError;
use crate::recovery::RecoveryOutcome;
use crate::session::{SessionField, SessionRequest};
use crate::AppState;

// Response types for callers

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<SessionField>,
    /// Pid of the already running tracker the session was handed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handed_off_to: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StopResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResult {
    pub running: bool,
}

// Commands

/// Start tracking an SOS session.
///
/// When a tracker is already running for the same data directory the
/// session is only persisted; that tracker switches to it on its next
/// store check.
pub async fn start_tracking(state: &AppState, request: SessionRequest) -> StartResult {
    info!(sos_id = request.sos_id.as_deref().unwrap_or(""), "Start tracking requested");

    let (outcome, handed_off_to) = match state.running_tracker() {
        Some(running) => {
            info!(pid = running.pid, tracking = %running.sos_id, "Tracker already running");
            (state.controller.hand_off(request).map(|_| ()), Some(running.pid))
        }
        None => (state.controller.start(request).await, None),
    };

    match outcome {
        Ok(()) => StartResult {
            success: true,
            error: None,
            error_kind: None,
            missing_fields: Vec::new(),
            handed_off_to,
        },
        Err(e) => {
            error!(error = %e, "Start tracking failed");
            let missing_fields = match &e {
                TrackerError::InvalidSession(invalid) => invalid.missing.clone(),
                _ => Vec::new(),
            };
            StartResult {
                success: false,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
                missing_fields,
                handed_off_to: None,
            }
        }
    }
}

/// Stop tracking and clear persisted state
pub async fn stop_tracking(state: &AppState) -> StopResult {
    info!("Stop tracking requested");

    match state.controller.stop().await {
        Ok(()) => StopResult {
            success: true,
            error: None,
        },
        Err(e) => StopResult {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

/// Whether a session is persisted as active
pub fn tracking_status(state: &AppState) -> Result<StatusResult, TrackerError> {
    let running = state.controller.status()?;
    debug!(running, "Tracking status");
    Ok(StatusResult { running })
}

/// Boot signal: resume a surviving session, unless a tracker is already
/// running it.
pub async fn boot_completed(state: &AppState) -> Result<RecoveryOutcome, TrackerError> {
    if let Some(running) = state.running_tracker() {
        info!(pid = running.pid, "Boot signal ignored, tracker already running");
        return Ok(RecoveryOutcome::AlreadyRunning { pid: running.pid });
    }
    state.recovery.on_boot().await
}
