//! Live Location Sync Module
//!
//! Publishes position samples to the remote live-location store.
//!
//! Delivery is best effort and at most once per sample: every publish runs
//! as its own task, failures are logged and dropped, nothing is retried.
//! The next sample supersedes a lost one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::location::PositionSample;

/// Default cap on concurrent in-flight publishes.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Server-assigned timestamp directive, resolved by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimestamp;

impl Serialize for ServerTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(".sv", "timestamp")?;
        map.end()
    }
}

/// Body written to `live_locations/{userId}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveLocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    pub last_updated: ServerTimestamp,
    pub sos_id: String,
}

impl LiveLocationPayload {
    pub fn new(sos_id: &str, sample: &PositionSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy,
            heading: sample.heading,
            speed: sample.speed,
            last_updated: ServerTimestamp,
            sos_id: sos_id.to_string(),
        }
    }
}

/// Write access to the remote live-location store.
#[async_trait]
pub trait LiveLocationTransport: Send + Sync {
    /// Merge `payload` into the location record of `user_id`.
    async fn write_location(
        &self,
        user_id: &str,
        identity_token: &str,
        payload: &LiveLocationPayload,
    ) -> Result<(), PublishFailure>;

    /// Delete the location record of `user_id`.
    async fn remove_location(&self, user_id: &str, identity_token: &str) -> Result<(), PublishFailure>;
}

/// REST transport for a realtime-database style store.
///
/// Writes go to `{base}/live_locations/{userId}.json?auth={token}` as a
/// `POST` carrying `X-HTTP-Method-Override: PATCH`. The user id is one
/// percent-encoded path segment.
pub struct RestTransport {
    base_url: Url,
    client: reqwest::Client,
}

impl RestTransport {
    /// Create a new REST transport
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PublishFailure> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PublishFailure::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(PublishFailure::InvalidUrl(base_url.to_string()));
        }

        let user_agent = format!(
            "sos-tracker/{} ({})",
            env!("CARGO_PKG_VERSION"),
            whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_string())
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| PublishFailure::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    fn location_url(&self, user_id: &str) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base can carry path segments.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("live_locations")
                .push(&format!("{}.json", user_id));
        }
        url
    }
}

#[async_trait]
impl LiveLocationTransport for RestTransport {
    async fn write_location(
        &self,
        user_id: &str,
        identity_token: &str,
        payload: &LiveLocationPayload,
    ) -> Result<(), PublishFailure> {
        let response = self
            .client
            .post(self.location_url(user_id))
            .query(&[("auth", identity_token)])
            .header("X-HTTP-Method-Override", "PATCH")
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| PublishFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishFailure::Server {
                status: status.as_u16(),
                message: body,
            });
        }

        debug!(status = status.as_u16(), "Live location update accepted");
        Ok(())
    }

    async fn remove_location(&self, user_id: &str, identity_token: &str) -> Result<(), PublishFailure> {
        let response = self
            .client
            .delete(self.location_url(user_id))
            .query(&[("auth", identity_token)])
            .send()
            .await
            .map_err(|e| PublishFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishFailure::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Publish counters.
#[derive(Debug, Default)]
pub struct SyncStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    /// Publish attempts started.
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Samples discarded because the in-flight limit was reached.
    pub dropped: u64,
}

impl SyncStatsSnapshot {
    /// Counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &SyncStatsSnapshot) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            dispatched: self.dispatched.saturating_sub(earlier.dispatched),
            succeeded: self.succeeded.saturating_sub(earlier.succeeded),
            failed: self.failed.saturating_sub(earlier.failed),
            dropped: self.dropped.saturating_sub(earlier.dropped),
        }
    }
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Fire-and-forget publisher with a bounded number of in-flight requests.
pub struct SyncClient {
    transport: Arc<dyn LiveLocationTransport>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    stats: Arc<SyncStats>,
}

impl SyncClient {
    pub fn new(transport: Arc<dyn LiveLocationTransport>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            stats: Arc::new(SyncStats::default()),
        }
    }

    /// Publish one sample without waiting for the request.
    ///
    /// Must be called from within a Tokio runtime. Returns false when the
    /// sample was dropped because too many publishes are already in flight.
    pub fn publish(
        &self,
        user_id: &str,
        identity_token: &str,
        sos_id: &str,
        sample: &PositionSample,
    ) -> bool {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(sos_id, "Publish capacity reached, dropping sample");
            return false;
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        let payload = LiveLocationPayload::new(sos_id, sample);
        let user_id = user_id.to_string();
        let identity_token = identity_token.to_string();

        tokio::spawn(async move {
            let _permit = permit;
            match transport.write_location(&user_id, &identity_token, &payload).await {
                Ok(()) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(sos_id = %payload.sos_id, "Live location published");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(sos_id = %payload.sos_id, error = %e, "Live location publish failed");
                }
            }
        });

        true
    }

    /// Delete the remote location record in the background.
    ///
    /// The returned handle lets a process that is about to exit wait for
    /// the request; dropping it leaves the request running.
    pub fn clear_remote(&self, user_id: &str, identity_token: &str) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let user_id = user_id.to_string();
        let identity_token = identity_token.to_string();

        tokio::spawn(async move {
            match transport.remove_location(&user_id, &identity_token).await {
                Ok(()) => info!(user_id = %user_id, "Remote live location removed"),
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to remove remote live location"),
            }
        })
    }

    /// Wait until no publish is in flight.
    pub async fn flush(&self) {
        if let Ok(all) = self.permits.acquire_many(self.max_in_flight as u32).await {
            drop(all);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Publish errors. Logged by the client, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum PublishFailure {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// One recorded write.
    #[derive(Debug, Clone)]
    pub struct RecordedWrite {
        pub user_id: String,
        pub identity_token: String,
        pub body: serde_json::Value,
    }

    /// Transport that records writes, optionally slow or failing.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub writes: Mutex<Vec<RecordedWrite>>,
        pub removals: Mutex<Vec<String>>,
        pub latency: Duration,
        pub fail_with: Option<u16>,
    }

    impl RecordingTransport {
        pub fn slow(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        pub fn failing(status: u16) -> Self {
            Self {
                fail_with: Some(status),
                ..Default::default()
            }
        }

        pub fn writes(&self) -> Vec<RecordedWrite> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LiveLocationTransport for RecordingTransport {
        async fn write_location(
            &self,
            user_id: &str,
            identity_token: &str,
            payload: &LiveLocationPayload,
        ) -> Result<(), PublishFailure> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.writes.lock().unwrap().push(RecordedWrite {
                user_id: user_id.to_string(),
                identity_token: identity_token.to_string(),
                body: serde_json::to_value(payload).unwrap(),
            });
            match self.fail_with {
                Some(status) => Err(PublishFailure::Server {
                    status,
                    message: "rejected".into(),
                }),
                None => Ok(()),
            }
        }

        async fn remove_location(&self, user_id: &str, _identity_token: &str) -> Result<(), PublishFailure> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.removals.lock().unwrap().push(user_id.to_string());
            Ok(())
        }
    }
}
