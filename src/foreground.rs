//! Foreground execution mode.
//!
//! While a session is active the tracker runs as a long-lived supervised
//! task. How that is made visible to the platform (a notification, a pid
//! file for a service manager) is up to the [`ForegroundMode`] in use.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::TrackingSession;

/// Platform hook entered when tracking starts and left when it stops.
pub trait ForegroundMode: Send + Sync {
    fn enter(&self, session: &TrackingSession);
    fn exit(&self);
}

/// No platform signal.
pub struct NoForeground;

impl ForegroundMode for NoForeground {
    fn enter(&self, _session: &TrackingSession) {}
    fn exit(&self) {}
}

/// Contents of the liveness file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessRecord {
    pub pid: u32,
    pub sos_id: String,
    pub since: DateTime<Utc>,
}

/// Writes a liveness file while tracking is active so a service manager
/// or watchdog can see the tracker is up.
pub struct PidFileForeground {
    path: PathBuf,
}

impl PidFileForeground {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the current liveness record, if any.
    pub fn read(&self) -> Option<LivenessRecord> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// The liveness record of a tracker process that is still running.
    /// A record left behind by a dead process is ignored.
    pub fn running(&self) -> Option<LivenessRecord> {
        let record = self.read()?;
        if is_process_alive(record.pid) {
            Some(record)
        } else {
            debug!(pid = record.pid, path = ?self.path, "Ignoring stale liveness file");
            None
        }
    }
}

/// Checks if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, BOOL};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    const STILL_ACTIVE: u32 = 259;

    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, BOOL::from(false), pid) else {
            return false;
        };
        let mut exit_code: u32 = 0;
        let queried = GetExitCodeProcess(handle, &mut exit_code).is_ok();
        let _ = CloseHandle(handle);
        queried && exit_code == STILL_ACTIVE
    }
}

impl ForegroundMode for PidFileForeground {
    fn enter(&self, session: &TrackingSession) {
        let record = LivenessRecord {
            pid: std::process::id(),
            sos_id: session.sos_id.clone(),
            since: Utc::now(),
        };
        let result = serde_json::to_vec(&record)
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(&self.path, bytes).map_err(|e| e.to_string()));

        match result {
            Ok(()) => info!(path = ?self.path, sos_id = %session.sos_id, "SOS tracking active"),
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to write liveness file"),
        }
    }

    fn exit(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Liveness file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove liveness file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn liveness_file_tracks_enter_and_exit() {
        let dir = TempDir::new().unwrap();
        let foreground = PidFileForeground::new(dir.path().join("tracker.pid"));
        let session = TrackingSession {
            sos_id: "S1".into(),
            sos_token: "T1".into(),
            identity_token: "I1".into(),
            user_id: "U1".into(),
        };

        foreground.enter(&session);
        let record = foreground.read().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.sos_id, "S1");

        foreground.exit();
        assert!(foreground.read().is_none());
        // Exiting twice is harmless.
        foreground.exit();
    }

    #[test]
    fn running_ignores_records_of_dead_processes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracker.pid");
        let foreground = PidFileForeground::new(&path);

        let stale = LivenessRecord {
            pid: 999_999_999,
            sos_id: "S1".into(),
            since: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();
        assert!(foreground.read().is_some());
        assert!(foreground.running().is_none());

        let live = LivenessRecord {
            pid: std::process::id(),
            ..stale
        };
        std::fs::write(&path, serde_json::to_vec(&live).unwrap()).unwrap();
        assert_eq!(foreground.running().unwrap().pid, std::process::id());
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }
}
