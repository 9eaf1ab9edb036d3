//! Recovery Trigger
//!
//! Handles the boot (or cold-start) signal: if a session outlived the last
//! process, tracking is resumed through the controller. Never writes to
//! the store.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::controller::SessionController;
use crate::error::TrackerError;

/// What the boot signal led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Resumed {
        #[serde(rename = "sosId")]
        sos_id: String,
    },
    NothingToResume,
    /// Another process is tracking already.
    AlreadyRunning { pid: u32 },
}

pub struct RecoveryTrigger {
    controller: Arc<SessionController>,
}

impl RecoveryTrigger {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }

    /// React to the boot signal.
    pub async fn on_boot(&self) -> Result<RecoveryOutcome, TrackerError> {
        info!("Boot signal received, checking for an SOS session");

        let Some(session) = self.controller.store().load()? else {
            info!("No SOS session to recover");
            return Ok(RecoveryOutcome::NothingToResume);
        };

        info!(sos_id = %session.sos_id, "Active SOS found, restarting tracking");
        if self.controller.resume().await? {
            Ok(RecoveryOutcome::Resumed {
                sos_id: session.sos_id,
            })
        } else {
            // Cleared between the check and the resume.
            Ok(RecoveryOutcome::NothingToResume)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TrackingState;
    use crate::foreground::NoForeground;
    use crate::location::{ExternalProvider, LocationSource, SubscriptionParams};
    use crate::session::TrackingSession;
    use crate::storage::SessionStore;
    use crate::sync::testing::RecordingTransport;
    use crate::sync::SyncClient;
    use tempfile::TempDir;

    fn controller(dir: &TempDir) -> Arc<SessionController> {
        let (gps, _feed) = ExternalProvider::named("gps");
        Arc::new(SessionController::new(
            Arc::new(SessionStore::open(dir.path())),
            Arc::new(LocationSource::new(vec![Arc::new(gps)])),
            Arc::new(SyncClient::new(Arc::new(RecordingTransport::default()), 2)),
            Arc::new(NoForeground),
            SubscriptionParams::default(),
        ))
    }

    #[tokio::test]
    async fn boot_without_session_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        let trigger = RecoveryTrigger::new(Arc::clone(&controller));

        assert_eq!(trigger.on_boot().await.unwrap(), RecoveryOutcome::NothingToResume);
        assert_eq!(controller.state(), TrackingState::Idle);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn boot_resumes_persisted_session() {
        let dir = TempDir::new().unwrap();
        let session = TrackingSession {
            sos_id: "S1".into(),
            sos_token: "T1".into(),
            identity_token: "I1".into(),
            user_id: "U1".into(),
        };
        SessionStore::open(dir.path()).save(&session).unwrap();

        let controller = controller(&dir);
        let trigger = RecoveryTrigger::new(Arc::clone(&controller));

        assert_eq!(
            trigger.on_boot().await.unwrap(),
            RecoveryOutcome::Resumed { sos_id: "S1".into() }
        );
        assert_eq!(controller.state(), TrackingState::Active);
        assert_eq!(controller.active_session().await, Some(session));
        assert_eq!(controller.location().active_subscriptions("gps"), 1);

        // A second boot signal does not stack subscriptions.
        trigger.on_boot().await.unwrap();
        assert_eq!(controller.location().active_subscriptions("gps"), 1);
    }
}
