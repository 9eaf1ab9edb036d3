//! Satellite provider: NMEA-0183 sentences over UDP.
//!
//! GNSS receivers, gpsd relays and phone "GPS over network" apps commonly
//! broadcast NMEA on UDP. We accept `RMC` and `GGA` sentences from any
//! talker (`GP`, `GN`, `GL`, ...).
//!
//! # Setup
//!
//! Point the receiver at this host, port 10110 by default.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::provider::{
    LocationError, PositionProvider, PositionSample, ProviderKind, SubscriptionParams,
};

/// Conventional NMEA-over-IP port.
pub const DEFAULT_NMEA_PORT: u16 = 10110;

/// Maximum datagram size we expect.
const MAX_PACKET_SIZE: usize = 2048;

/// Conversion factor: knots to meters per second.
const KNOTS_TO_MS: f32 = 0.514_444;

/// Rough horizontal error per unit of HDOP, in meters.
const HDOP_TO_METERS: f32 = 5.0;

/// NMEA receiver configuration.
#[derive(Debug, Clone)]
pub struct NmeaUdpConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Idle time after which a "waiting for fixes" note is logged.
    pub recv_timeout: Duration,
}

impl Default for NmeaUdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: DEFAULT_NMEA_PORT,
            recv_timeout: Duration::from_secs(30),
        }
    }
}

/// Satellite position provider reading NMEA datagrams.
pub struct NmeaUdpProvider {
    config: NmeaUdpConfig,
}

impl NmeaUdpProvider {
    pub fn new(config: NmeaUdpConfig) -> Self {
        Self { config }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }
}

#[async_trait]
impl PositionProvider for NmeaUdpProvider {
    fn name(&self) -> &str {
        "nmea"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Satellite
    }

    async fn register(
        &self,
        _params: &SubscriptionParams,
        fixes: mpsc::Sender<PositionSample>,
    ) -> Result<JoinHandle<()>, LocationError> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let socket = UdpSocket::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                LocationError::PermissionDenied {
                    provider: self.name().into(),
                    reason: format!("cannot bind {}: {}", addr, e),
                }
            } else {
                LocationError::Unavailable {
                    provider: self.name().into(),
                    reason: format!("cannot bind {}: {}", addr, e),
                }
            }
        })?;

        info!(local_addr = ?socket.local_addr().ok(), "NMEA receiver listening");
        Ok(tokio::spawn(receive_loop(socket, fixes, self.config.recv_timeout)))
    }
}

async fn receive_loop(socket: UdpSocket, fixes: mpsc::Sender<PositionSample>, idle: Duration) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];
    let mut packets_received: u64 = 0;
    let mut fixes_sent: u64 = 0;

    loop {
        if fixes.is_closed() {
            break;
        }

        match tokio::time::timeout(idle, socket.recv(&mut buffer)).await {
            Ok(Ok(len)) => {
                packets_received += 1;
                let text = String::from_utf8_lossy(&buffer[..len]);
                for sample in text.lines().filter_map(parse_sentence) {
                    fixes_sent += 1;
                    if fixes_sent == 1 {
                        info!(
                            lat = format!("{:.5}", sample.latitude),
                            lon = format!("{:.5}", sample.longitude),
                            "First NMEA fix"
                        );
                    }
                    if fixes.send(sample).await.is_err() {
                        debug!(packets_received, fixes_sent, "NMEA receiver stopped");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "UDP receive error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => {
                debug!(packets_received, "No NMEA data received, still waiting");
            }
        }
    }

    debug!(packets_received, fixes_sent, "NMEA receiver stopped");
}

/// Parse one NMEA sentence into a fix. Returns `None` for sentences that
/// carry no valid position.
pub fn parse_sentence(line: &str) -> Option<PositionSample> {
    let line = line.trim();
    let body = line.strip_prefix('$')?;

    let body = match body.split_once('*') {
        Some((body, checksum)) => {
            let expected = u8::from_str_radix(checksum.get(..2)?, 16).ok()?;
            if nmea_checksum(body) != expected {
                trace!(sentence = line, "NMEA checksum mismatch");
                return None;
            }
            body
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let sentence_type = fields.first()?.get(2..)?;

    match sentence_type {
        "RMC" => parse_rmc(&fields),
        "GGA" => parse_gga(&fields),
        _ => None,
    }
}

/// `$--RMC,time,status,lat,N/S,lon,E/W,speed_kn,course,date,...`
fn parse_rmc(fields: &[&str]) -> Option<PositionSample> {
    if fields.len() < 9 || *fields.get(2)? != "A" {
        return None;
    }
    let latitude = parse_coordinate(fields[3], fields[4], 2)?;
    let longitude = parse_coordinate(fields[5], fields[6], 3)?;
    let speed = fields[7].parse::<f32>().ok().map(|kn| kn * KNOTS_TO_MS);
    let heading = fields[8].parse::<f32>().ok();

    Some(
        PositionSample::new(latitude, longitude, ProviderKind::Satellite)
            .with_motion(heading, speed),
    )
}

/// `$--GGA,time,lat,N/S,lon,E/W,quality,sats,hdop,alt,...`
fn parse_gga(fields: &[&str]) -> Option<PositionSample> {
    if fields.len() < 9 {
        return None;
    }
    let quality: u8 = fields[6].parse().ok()?;
    if quality == 0 {
        return None;
    }
    let latitude = parse_coordinate(fields[2], fields[3], 2)?;
    let longitude = parse_coordinate(fields[4], fields[5], 3)?;

    let mut sample = PositionSample::new(latitude, longitude, ProviderKind::Satellite);
    if let Ok(hdop) = fields[8].parse::<f32>() {
        sample = sample.with_accuracy(hdop * HDOP_TO_METERS);
    }
    Some(sample)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    if !(0.0..60.0).contains(&minutes) {
        return None;
    }
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn parses_rmc_with_motion() {
        let fix = parse_sentence(RMC).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.longitude - 11.516_666).abs() < 1e-4);
        assert_eq!(fix.heading, Some(84.4));
        assert!((fix.speed.unwrap() - 11.523).abs() < 0.01);
        assert_eq!(fix.provider, ProviderKind::Satellite);
    }

    #[test]
    fn parses_gga_with_accuracy() {
        let fix = parse_sentence(GGA).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.accuracy.unwrap() - 4.5).abs() < 1e-4);
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        let fix = parse_sentence("$GNRMC,000000,A,3351.000,S,15112.000,W,0.0,0.0,010125,,").unwrap();
        assert!((fix.latitude + 33.85).abs() < 1e-6);
        assert!((fix.longitude + 151.2).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_checksum_and_void_fixes() {
        assert!(parse_sentence(&RMC.replace("*6A", "*00")).is_none());
        assert!(parse_sentence(&RMC.replace(",A,", ",V,").replace("*6A", "")).is_none());
        assert!(parse_sentence("$GPGGA,123519,4807.038,N,01131.000,E,0,00,,,M,,M,,").is_none());
        assert!(parse_sentence("$GPGSV,3,1,11,03,03,111,00").is_none());
        assert!(parse_sentence("garbage").is_none());
    }

    #[tokio::test]
    async fn receive_loop_forwards_parsed_fixes() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(receive_loop(socket, tx, Duration::from_secs(5)));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = format!("$GPGSV,3,1,11\r\n{}\r\n", RMC);
        sender.send_to(datagram.as_bytes(), addr).await.unwrap();

        let fix = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        task.abort();
    }
}
