//! Integration tests for the SOS tracking lifecycle.
//!
//! These drive the public command surface end to end:
//! - start → status → sample → publish → stop → status
//! - rejected start leaves nothing persisted
//! - a fresh process resumes the session on the boot signal
//! - a second start against a running tracker hands the session over
//!
//! Run with: `cargo test --test tracking_lifecycle`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use sos_tracker_lib::{
    commands,
    config::TrackerConfig,
    controller::{StoreCheck, TrackingState},
    foreground::{NoForeground, PidFileForeground},
    location::{ExternalFeed, ExternalProvider, PositionSample, ProviderKind},
    recovery::RecoveryOutcome,
    session::{SessionField, SessionRequest},
    sync::{LiveLocationPayload, LiveLocationTransport, PublishFailure},
    AppState,
};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct RecordingTransport {
    writes: Mutex<Vec<(String, serde_json::Value)>>,
    removals: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn writes(&self) -> Vec<(String, serde_json::Value)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveLocationTransport for RecordingTransport {
    async fn write_location(
        &self,
        user_id: &str,
        _identity_token: &str,
        payload: &LiveLocationPayload,
    ) -> Result<(), PublishFailure> {
        self.writes
            .lock()
            .unwrap()
            .push((user_id.to_string(), serde_json::to_value(payload).unwrap()));
        Ok(())
    }

    async fn remove_location(&self, user_id: &str, _identity_token: &str) -> Result<(), PublishFailure> {
        self.removals.lock().unwrap().push(user_id.to_string());
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> TrackerConfig {
    TrackerConfig {
        data_dir: dir.path().to_path_buf(),
        min_interval: Duration::ZERO,
        min_distance_m: 0.0,
        nmea_port: None,
        ..Default::default()
    }
}

/// App state that announces itself through the liveness file, like the
/// daemon does.
fn create_daemon_app(config: TrackerConfig) -> (AppState, ExternalFeed, Arc<RecordingTransport>) {
    let (provider, feed) = ExternalProvider::named("device");
    let transport = Arc::new(RecordingTransport::default());
    let liveness = config.liveness_path();
    let state = AppState::with_parts(
        config,
        vec![Arc::new(provider)],
        transport.clone(),
        Arc::new(PidFileForeground::new(liveness)),
    );
    (state, feed, transport)
}

/// Build app state backed by an external provider and a recording transport.
fn create_app(config: TrackerConfig) -> (AppState, ExternalFeed, Arc<RecordingTransport>) {
    let (provider, feed) = ExternalProvider::named("device");
    let transport = Arc::new(RecordingTransport::default());
    let state = AppState::with_parts(
        config,
        vec![Arc::new(provider)],
        transport.clone(),
        Arc::new(NoForeground),
    );
    (state, feed, transport)
}

fn sos_request() -> SessionRequest {
    SessionRequest {
        sos_id: Some("S1".into()),
        sos_token: Some("T1".into()),
        identity_token: Some("I1".into()),
        user_id: Some("U1".into()),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn start_publish_stop_round() {
    let dir = TempDir::new().unwrap();
    let (state, feed, transport) = create_app(test_config(&dir));

    let started = commands::start_tracking(&state, sos_request()).await;
    assert!(started.success, "start failed: {:?}", started.error);
    assert!(commands::tracking_status(&state).unwrap().running);

    assert!(feed.push(PositionSample::new(12.97, 77.59, ProviderKind::External)));
    wait_until(|| transport.writes().len() == 1).await;

    let writes = transport.writes();
    let (user_id, body) = &writes[0];
    assert_eq!(user_id, "U1");
    assert_eq!(body["latitude"], 12.97);
    assert_eq!(body["longitude"], 77.59);
    assert_eq!(body["sosId"], "S1");
    assert_eq!(body["lastUpdated"], serde_json::json!({".sv": "timestamp"}));

    let stopped = commands::stop_tracking(&state).await;
    assert!(stopped.success);
    assert!(!commands::tracking_status(&state).unwrap().running);
    assert_eq!(state.controller.store().load().unwrap(), None);
    assert_eq!(state.controller.location().active_subscriptions("device"), 0);
}

#[tokio::test]
async fn start_with_empty_token_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (state, _feed, _transport) = create_app(test_config(&dir));

    let mut request = sos_request();
    request.sos_token = Some(String::new());
    let result = commands::start_tracking(&state, request).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some("invalid_session"));
    assert_eq!(result.missing_fields, vec![SessionField::SosToken]);
    assert_eq!(state.controller.store().load().unwrap(), None);
    assert!(!commands::tracking_status(&state).unwrap().running);
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    let (state, _feed, _transport) = create_app(test_config(&dir));

    assert!(commands::start_tracking(&state, sos_request()).await.success);
    assert!(commands::stop_tracking(&state).await.success);
    assert!(commands::stop_tracking(&state).await.success);
    assert_eq!(state.controller.state(), TrackingState::Idle);
}

#[tokio::test]
async fn boot_signal_resumes_session_in_new_process() {
    let dir = TempDir::new().unwrap();

    {
        let (first, _feed, _transport) = create_app(test_config(&dir));
        assert!(commands::start_tracking(&first, sos_request()).await.success);
        // Process dies without an explicit stop.
        first.controller.shutdown().await;
    }

    let (second, feed, transport) = create_app(test_config(&dir));
    assert_eq!(second.controller.state(), TrackingState::Idle);

    let outcome = commands::boot_completed(&second).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Resumed { sos_id: "S1".into() });
    assert_eq!(second.controller.state(), TrackingState::Active);

    // Boot twice, still one registration.
    commands::boot_completed(&second).await.unwrap();
    assert_eq!(second.controller.location().active_subscriptions("device"), 1);

    feed.push(PositionSample::new(21.15, 79.09, ProviderKind::External));
    wait_until(|| transport.writes().len() == 1).await;
    assert_eq!(transport.writes()[0].1["sosId"], "S1");
}

#[tokio::test]
async fn boot_without_session_does_nothing() {
    let dir = TempDir::new().unwrap();
    let (state, _feed, _transport) = create_app(test_config(&dir));

    let outcome = commands::boot_completed(&state).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::NothingToResume);
    assert_eq!(state.controller.state(), TrackingState::Idle);
}

#[tokio::test]
async fn stop_clears_remote_record_when_configured() {
    let dir = TempDir::new().unwrap();
    let config = TrackerConfig {
        clear_remote_on_stop: true,
        ..test_config(&dir)
    };
    let (state, _feed, transport) = create_app(config);

    assert!(commands::start_tracking(&state, sos_request()).await.success);
    assert!(commands::stop_tracking(&state).await.success);

    // What the daemon does on its way out.
    state
        .controller
        .finish_remote_cleanup(Duration::from_secs(1))
        .await;
    assert_eq!(*transport.removals.lock().unwrap(), vec!["U1".to_string()]);
}

#[tokio::test]
async fn denied_permission_reports_distinct_error() {
    let dir = TempDir::new().unwrap();
    let (state, feed, _transport) = create_app(test_config(&dir));
    feed.set_authorized(false);

    let result = commands::start_tracking(&state, sos_request()).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some("permission_denied"));
    assert_eq!(state.controller.state(), TrackingState::Idle);
}

#[tokio::test]
async fn liveness_file_follows_session() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let liveness = config.liveness_path();
    let (provider, _feed) = ExternalProvider::named("device");
    let state = AppState::with_parts(
        config,
        vec![Arc::new(provider)],
        Arc::new(RecordingTransport::default()),
        Arc::new(PidFileForeground::new(&liveness)),
    );

    assert!(commands::start_tracking(&state, sos_request()).await.success);
    assert!(liveness.exists());

    assert!(commands::stop_tracking(&state).await.success);
    assert!(!liveness.exists());
}

#[tokio::test]
async fn second_start_hands_session_to_running_tracker() {
    let dir = TempDir::new().unwrap();
    let (daemon, daemon_feed, daemon_transport) = create_daemon_app(test_config(&dir));
    let (second, _second_feed, _second_transport) = create_daemon_app(test_config(&dir));

    assert!(commands::start_tracking(&daemon, sos_request()).await.success);

    let mut request = sos_request();
    request.sos_id = Some("S2".into());
    let result = commands::start_tracking(&second, request).await;
    assert!(result.success);
    assert_eq!(result.handed_off_to, Some(std::process::id()));

    // Only one tracker is running; the store holds the new session.
    assert_eq!(second.controller.state(), TrackingState::Idle);
    assert_eq!(second.controller.location().active_subscriptions("device"), 0);
    assert_eq!(second.controller.store().load().unwrap().unwrap().sos_id, "S2");

    // The running tracker follows the store on its next check.
    assert_eq!(
        daemon.controller.reconcile().await.unwrap(),
        StoreCheck::Switched { sos_id: "S2".into() }
    );
    assert_eq!(daemon.controller.active_session().await.unwrap().sos_id, "S2");

    daemon_feed.push(PositionSample::new(12.97, 77.59, ProviderKind::External));
    wait_until(|| daemon_transport.writes().len() == 1).await;
    assert_eq!(daemon_transport.writes()[0].1["sosId"], "S2");

    // A boot signal in the second process leaves the running tracker alone.
    let outcome = commands::boot_completed(&second).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::AlreadyRunning { pid: std::process::id() });
    assert_eq!(second.controller.state(), TrackingState::Idle);
}

#[tokio::test]
async fn stop_from_another_process_ends_running_tracker() {
    let dir = TempDir::new().unwrap();
    let (daemon, _feed, _transport) = create_daemon_app(test_config(&dir));
    let (other, _other_feed, _other_transport) = create_app(test_config(&dir));

    assert!(commands::start_tracking(&daemon, sos_request()).await.success);
    assert!(commands::stop_tracking(&other).await.success);

    assert_eq!(daemon.controller.reconcile().await.unwrap(), StoreCheck::Cleared);
    assert_eq!(daemon.controller.state(), TrackingState::Idle);
    assert_eq!(daemon.controller.location().active_subscriptions("device"), 0);
    assert!(!daemon.config.liveness_path().exists());
}
