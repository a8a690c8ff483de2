//! Pure connection state management for the MQTT client
//!
//! This module contains the connection state type, the reconnect backoff
//! policy, broker URL parsing and the assembly of CONNECT parameters from
//! configuration. Nothing here performs I/O.

use crate::config::BrokerSection;
use crate::protocol::{Connect, ConnectReturnCode, ProtocolError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not running, or stopped
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// CONNACK accepted and subscriptions replayed
    Connected,
    /// Waiting out the backoff before reconnect attempt `n`
    Reconnecting(u32),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("DISCONNECTED"),
            ConnectionState::Connecting => f.write_str("CONNECTING"),
            ConnectionState::Connected => f.write_str("CONNECTED"),
            ConnectionState::Reconnecting(attempt) => write!(f, "RECONNECTING({attempt})"),
        }
    }
}

/// Reconnection backoff configuration
///
/// Attempt `n` waits `base * 2^(n-1)` milliseconds, capped at `max_delay_ms`,
/// then scaled by a random factor in `[1 - jitter, 1 + jitter]` and clamped
/// back into `[0, max_delay_ms]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter, `0.2` means +-20%
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Nominal (unjittered) delay before reconnect attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Delay for `attempt` with jitter applied
    ///
    /// `sample` is a uniform value in `[-1, 1]`; values outside are clamped.
    pub fn jittered_delay(&self, attempt: u32, sample: f64) -> u64 {
        let nominal = self.calculate_backoff_delay(attempt) as f64;
        let sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let delayed = nominal * (1.0 + self.jitter * sample);
        delayed.clamp(0.0, self.max_delay_ms as f64).round() as u64
    }

    /// Sanity-check the backoff parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("reconnect.base_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "reconnect.max_delay_ms ({}) must be at least base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!(
                "reconnect.jitter ({}) must be in [0, 1)",
                self.jitter
            ));
        }
        Ok(())
    }
}

/// Uniform sample in `[-1, 1]` for backoff jitter
pub fn jitter_sample() -> f64 {
    // low 53 bits of a v4 UUID are all random and fill an f64 mantissa exactly
    let bits = (Uuid::new_v4().as_u128() as u64) & ((1u64 << 53) - 1);
    (bits as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
}

/// Transport-level failures, all of which are retried except auth refusals
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Connection refused by broker: {0}")]
    Refused(ConnectReturnCode),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Connection closed")]
    Closed,
    #[error("No PINGRESP within {0:?}")]
    KeepAliveTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

impl TransportError {
    /// CONNACK refusals for bad credentials or missing authorisation
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Refused(code) if code.is_auth_failure())
    }
}

/// Host, port and security of a broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://` (port 1883) or `ssl://`, `mqtts://` (port 8883)
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBrokerUrl(broker_url.to_string());
        let url = Url::parse(broker_url).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(invalid()),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Everything needed to open one session with the broker
#[derive(Clone)]
pub struct ConnectionParams {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl ConnectionParams {
    /// CONNECT packet for these parameters
    pub fn connect_packet(&self) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.as_ref().map(|p| p.as_bytes().to_vec()),
        }
    }

    /// Bound on a single socket write: 1.5 x keep-alive, or the connect timeout
    pub fn send_timeout(&self) -> Duration {
        if self.keep_alive.is_zero() {
            self.connect_timeout
        } else {
            self.keep_alive.mul_f64(1.5)
        }
    }
}

/// Pure function building connection parameters from configuration
///
/// Credentials are read from the environment here, so rotating them only
/// needs a reconnect.
pub fn connection_params(
    client_id: &str,
    config: &BrokerSection,
) -> Result<ConnectionParams, TransportError> {
    let broker = BrokerAddress::parse(&config.url)?;

    let username = config.username();
    let password = username.as_ref().and(config.password());

    Ok(ConnectionParams {
        broker,
        client_id: client_id.to_string(),
        username,
        password,
        keep_alive: Duration::from_secs(u64::from(config.keep_alive_secs)),
        clean_session: config.clean_session,
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        max_packet_size: config.max_packet_size,
    })
}
