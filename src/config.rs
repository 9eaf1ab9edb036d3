//! Configuration Module
//!
//! Defaults overridable through `SOS_TRACKER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::location::{DEFAULT_MIN_DISTANCE_M, DEFAULT_MIN_INTERVAL, DEFAULT_NMEA_PORT};
use crate::sync::DEFAULT_MAX_IN_FLIGHT;

const DEFAULT_DATABASE_URL: &str =
    "https://vnit-girls-safety-default-rtdb.asia-southeast1.firebasedatabase.app";

/// Tracker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Base URL of the remote live-location store.
    pub database_url: String,
    /// Directory holding the session record and liveness file.
    pub data_dir: PathBuf,
    pub min_interval: Duration,
    pub min_distance_m: f64,
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    /// UDP port for NMEA input; `None` disables the satellite provider.
    pub nmea_port: Option<u16>,
    /// Geolocation endpoint for the network provider.
    pub geolocation_url: Option<String>,
    /// Delete the remote location record when a session is stopped.
    pub clear_remote_on_stop: bool,
    /// How often a running tracker re-reads the store to notice an
    /// external stop or a session handed over by another process.
    pub store_poll_interval: Duration,
    /// Daily log files kept before the oldest is deleted.
    pub log_retention_days: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            data_dir: default_data_dir(),
            min_interval: DEFAULT_MIN_INTERVAL,
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            request_timeout: Duration::from_secs(15),
            nmea_port: Some(DEFAULT_NMEA_PORT),
            geolocation_url: None,
            clear_remote_on_stop: false,
            store_poll_interval: Duration::from_secs(3),
            log_retention_days: 7,
        }
    }
}

impl TrackerConfig {
    /// Configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get("SOS_TRACKER_DATABASE_URL") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::invalid("SOS_TRACKER_DATABASE_URL", &url));
            }
            config.database_url = url;
        }
        if let Some(dir) = get("SOS_TRACKER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("SOS_TRACKER_MIN_INTERVAL_SECS") {
            config.min_interval = Duration::from_secs(parse("SOS_TRACKER_MIN_INTERVAL_SECS", &secs)?);
        }
        if let Some(meters) = get("SOS_TRACKER_MIN_DISTANCE_M") {
            let meters: f64 = parse("SOS_TRACKER_MIN_DISTANCE_M", &meters)?;
            if !meters.is_finite() || meters < 0.0 {
                return Err(ConfigError::invalid("SOS_TRACKER_MIN_DISTANCE_M", &meters.to_string()));
            }
            config.min_distance_m = meters;
        }
        if let Some(n) = get("SOS_TRACKER_MAX_IN_FLIGHT") {
            let n: usize = parse("SOS_TRACKER_MAX_IN_FLIGHT", &n)?;
            if n == 0 {
                return Err(ConfigError::invalid("SOS_TRACKER_MAX_IN_FLIGHT", "0"));
            }
            config.max_in_flight = n;
        }
        if let Some(secs) = get("SOS_TRACKER_REQUEST_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse("SOS_TRACKER_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(port) = get("SOS_TRACKER_NMEA_PORT") {
            config.nmea_port = match port.to_ascii_lowercase().as_str() {
                "off" | "none" | "disabled" => None,
                _ => Some(parse("SOS_TRACKER_NMEA_PORT", &port)?),
            };
        }
        if let Some(url) = get("SOS_TRACKER_GEOLOCATION_URL") {
            config.geolocation_url = Some(url);
        }
        if let Some(flag) = get("SOS_TRACKER_CLEAR_REMOTE_ON_STOP") {
            config.clear_remote_on_stop = parse_bool("SOS_TRACKER_CLEAR_REMOTE_ON_STOP", &flag)?;
        }
        if let Some(secs) = get("SOS_TRACKER_STORE_POLL_SECS") {
            let secs: u64 = parse("SOS_TRACKER_STORE_POLL_SECS", &secs)?;
            config.store_poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(days) = get("SOS_TRACKER_LOG_RETENTION_DAYS") {
            let days: usize = parse("SOS_TRACKER_LOG_RETENTION_DAYS", &days)?;
            if days == 0 {
                return Err(ConfigError::invalid("SOS_TRACKER_LOG_RETENTION_DAYS", "0"));
            }
            config.log_retention_days = days;
        }

        Ok(config)
    }

    /// Directory for rotated log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Liveness file written while tracking.
    pub fn liveness_path(&self) -> PathBuf {
        self.data_dir.join("tracker.pid")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("SOSTracker")
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::invalid(key, value))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
        }
    }
}
