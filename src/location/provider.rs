//! Provider trait and the types shared by every position provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default minimum time between delivered samples.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Default minimum distance between delivered samples, in meters.
pub const DEFAULT_MIN_DISTANCE_M: f64 = 5.0;

/// Where a fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// GNSS receiver.
    Satellite,
    /// Network-based lookup (Wi-Fi / cell / IP).
    Network,
    /// Fixes pushed in by the host platform.
    External,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Satellite => write!(f, "satellite"),
            ProviderKind::Network => write!(f, "network"),
            ProviderKind::External => write!(f, "external"),
        }
    }
}

/// A single position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, if the provider reports one.
    pub accuracy: Option<f32>,
    /// Course over ground in degrees.
    pub heading: Option<f32>,
    /// Ground speed in meters per second.
    pub speed: Option<f32>,
    pub provider: ProviderKind,
    /// Local receive time. The remote store assigns its own timestamp.
    pub observed_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, provider: ProviderKind) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            heading: None,
            speed: None,
            provider,
            observed_at: Utc::now(),
        }
    }

    pub fn with_accuracy(mut self, meters: f32) -> Self {
        self.accuracy = Some(meters);
        self
    }

    pub fn with_motion(mut self, heading: Option<f32>, speed: Option<f32>) -> Self {
        self.heading = heading;
        self.speed = speed;
        self
    }

    /// Latitude and longitude are finite and on the globe.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other`, in meters.
    pub fn distance_to(&self, other: &PositionSample) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

const EARTH_RADIUS_M: f64 = 6_371_008.8;

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Rate-limiting thresholds for a subscription.
///
/// Providers decide actual delivery timing; these only suppress samples
/// that arrive too soon or too close to the last delivered one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionParams {
    pub min_interval: Duration,
    pub min_distance_m: f64,
}

impl Default for SubscriptionParams {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
        }
    }
}

/// Location errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    /// The host refused access to the provider.
    #[error("Location permission denied for {provider}: {reason}")]
    PermissionDenied { provider: String, reason: String },

    #[error("Location provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("No position providers configured")]
    NoProviders,
}

/// A source of position fixes.
///
/// `register` must return as soon as the provider is set up; fix delivery
/// happens on the returned task, which the caller aborts to unregister.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Stable name used in logs and subscription bookkeeping.
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Start delivering fixes into `fixes`.
    async fn register(
        &self,
        params: &SubscriptionParams,
        fixes: mpsc::Sender<PositionSample>,
    ) -> Result<JoinHandle<()>, LocationError>;
}
