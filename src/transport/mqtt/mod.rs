//! MQTT 3.1.1 transport over TCP or TLS
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state, backoff policy and CONNECT parameters
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`keep_alive`] - Keep-alive ping and timeout bookkeeping
//! - [`tls`] - rustls client configuration
//! - [`stream`] - Socket I/O and the CONNECT/CONNACK handshake

pub mod connection;
pub mod health_monitor;
pub mod keep_alive;
pub mod stream;
pub mod tls;

pub use connection::{
    connection_params, jitter_sample, BrokerAddress, ConnectionParams, ConnectionState,
    ReconnectConfig, TransportError,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use keep_alive::{KeepAlive, KeepAliveAction};
pub use stream::{MqttConnector, MqttLink};
