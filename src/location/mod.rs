//! Location Module
//!
//! Position acquisition for an active session.
//!
//! # Components
//!
//! - [`provider`] - `PositionProvider` trait, `PositionSample`, `SubscriptionParams`
//! - [`source`] - `LocationSource` that subscribes to every provider at once
//!   and hands out a `ProviderSubscription`
//! - [`nmea`] - Satellite fixes from NMEA-0183 over UDP
//! - [`network`] - Network fixes from an HTTP geolocation endpoint
//! - [`external`] - Fixes pushed in by the host application
//!
//! Samples from different providers are delivered independently through the
//! same channel; nothing reconciles them.

pub mod external;
pub mod network;
pub mod nmea;
mod provider;
mod source;

pub use external::{ExternalFeed, ExternalProvider};
pub use network::NetworkProvider;
pub use nmea::{NmeaUdpConfig, NmeaUdpProvider, DEFAULT_NMEA_PORT};
pub use provider::{
    LocationError, PositionProvider, PositionSample, ProviderKind, SubscriptionParams,
    DEFAULT_MIN_DISTANCE_M, DEFAULT_MIN_INTERVAL,
};
pub use source::{LocationSource, ProviderSubscription};
