//! Network provider: polls an HTTP geolocation endpoint.
//!
//! Accepts either a flat `{latitude, longitude, accuracy}` body or the
//! `{location: {lat, lng}, accuracy}` shape used by common geolocation APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::provider::{
    LocationError, PositionProvider, PositionSample, ProviderKind, SubscriptionParams,
};

/// Lower bound on the polling period, whatever the subscription asks for.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Network-based position provider.
pub struct NetworkProvider {
    url: String,
    client: reqwest::Client,
}

impl NetworkProvider {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, LocationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LocationError::Unavailable {
                provider: "network".into(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl PositionProvider for NetworkProvider {
    fn name(&self) -> &str {
        "network"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Network
    }

    async fn register(
        &self,
        params: &SubscriptionParams,
        fixes: mpsc::Sender<PositionSample>,
    ) -> Result<JoinHandle<()>, LocationError> {
        let period = params.min_interval.max(MIN_POLL_INTERVAL);
        info!(url = %self.url, period_secs = period.as_secs_f32(), "Network geolocation polling");
        Ok(tokio::spawn(poll_loop(
            self.client.clone(),
            self.url.clone(),
            period,
            fixes,
        )))
    }
}

async fn poll_loop(
    client: reqwest::Client,
    url: String,
    period: Duration,
    fixes: mpsc::Sender<PositionSample>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if fixes.is_closed() {
            break;
        }

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, is_timeout = e.is_timeout(), "Geolocation request failed");
                continue;
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(status = status.as_u16(), "Geolocation access denied, network provider stopping");
            break;
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Geolocation endpoint returned error status");
            continue;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to read geolocation response");
                continue;
            }
        };

        match parse_response(&body) {
            Some(sample) => {
                if fixes.send(sample).await.is_err() {
                    break;
                }
            }
            None => debug!("Geolocation response carried no usable position"),
        }
    }

    debug!("Network geolocation polling stopped");
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeolocationResponse {
    Flat {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy: Option<f32>,
    },
    Nested {
        location: LatLng,
        #[serde(default)]
        accuracy: Option<f32>,
    },
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Decode a geolocation response body.
pub fn parse_response(body: &str) -> Option<PositionSample> {
    let (latitude, longitude, accuracy) = match serde_json::from_str(body).ok()? {
        GeolocationResponse::Flat {
            latitude,
            longitude,
            accuracy,
        } => (latitude, longitude, accuracy),
        GeolocationResponse::Nested { location, accuracy } => {
            (location.lat, location.lng, accuracy)
        }
    };

    let mut sample = PositionSample::new(latitude, longitude, ProviderKind::Network);
    sample.accuracy = accuracy;
    Some(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_body() {
        let sample = parse_response(r#"{"latitude":12.97,"longitude":77.59,"accuracy":40}"#).unwrap();
        assert_eq!(sample.latitude, 12.97);
        assert_eq!(sample.longitude, 77.59);
        assert_eq!(sample.accuracy, Some(40.0));
        assert_eq!(sample.provider, ProviderKind::Network);
    }

    #[test]
    fn parses_nested_body_without_accuracy() {
        let sample = parse_response(r#"{"location":{"lat":-33.85,"lng":151.2}}"#).unwrap();
        assert_eq!(sample.latitude, -33.85);
        assert_eq!(sample.longitude, 151.2);
        assert_eq!(sample.accuracy, None);
    }

    #[test]
    fn rejects_unrelated_bodies() {
        assert!(parse_response(r#"{"error":"quota"}"#).is_none());
        assert!(parse_response("not json").is_none());
    }
}
