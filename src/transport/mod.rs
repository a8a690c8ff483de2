//! Transport layer: the seam between the session and the broker socket
//!
//! The session worker only talks to the broker through [`Connector`] and
//! [`Link`]. [`mqtt::MqttConnector`] is the TCP/TLS implementation; tests
//! plug in [`crate::testing::MockConnector`].

use crate::protocol::Packet;

pub mod mqtt;

pub use mqtt::{
    connection_params, BrokerAddress, ConnectionParams, ConnectionState, MqttConnector,
    ReconnectConfig, TransportError,
};

/// Result of a successful CONNECT/CONNACK handshake
pub struct Connected {
    pub link: Box<dyn Link>,
    /// CONNACK session-present flag
    pub session_present: bool,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("session_present", &self.session_present)
            .finish_non_exhaustive()
    }
}

/// Opens handshaken links to the broker
///
/// A CONNACK with a non-zero return code must be reported as
/// [`TransportError::Refused`] so the session can tell auth failures apart.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, TransportError>;
}

/// An open connection carrying framed MQTT packets
///
/// `receive` must be cancel safe: the worker races it against timers and
/// commands and drops the future when another branch wins.
#[async_trait::async_trait]
pub trait Link: Send {
    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError>;

    async fn receive(&mut self) -> Result<Packet, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
