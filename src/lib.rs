//! safewatch - MQTT client core for child-safety monitoring
//!
//! Keeps a persistent MQTT 3.1.1 session to a broker, delivers outbound
//! messages with QoS 1/2 guarantees across reconnects and restarts, routes
//! inbound messages to topic handlers and turns safety events into
//! deduplicated user notifications.
//!
//! # Overview
//!
//! - [`protocol`]: MQTT 3.1.1 packet codec and topic filter matching
//! - [`transport`]: TCP/TLS links, keep-alive and reconnect policy
//! - [`session`]: the [`SafetyClient`] facade and its background worker
//! - [`subscriptions`]: filter registry and handler dispatch
//! - [`delivery`]: the QoS 1/2 state machine with its sled-backed store
//! - [`notifications`]: event parsing, dedup window and history
//!
//! # Quick Start
//!
//! ```rust
//! use safewatch::{ClientConfig, QoS, SafetyClient};
//! use safewatch::testing::MockConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::from_toml_str(r#"
//! [broker]
//! url = "tcp://broker.local:1883"
//! client_id = "tablet-kitchen"
//! "#).unwrap();
//!
//! let client = SafetyClient::new(config, Arc::new(MockConnector::new())).unwrap();
//! let queued = client.publish("iot/ack", "seen", QoS::AtLeastOnce).await.unwrap();
//! assert!(queued.packet_id.is_some());
//! # });
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod notifications;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod subscriptions;
pub mod testing;
pub mod transport;

pub use config::ClientConfig;
pub use delivery::{DeliveryState, PendingMessage};
pub use error::{ClientError, ClientResult};
pub use notifications::{Notification, NotificationDispatcher, Notifier};
pub use protocol::QoS;
pub use session::{ClientEvent, RestoredSubscription, SafetyClient};
pub use subscriptions::{EventHandler, InboundEvent, SubscriptionId};
pub use transport::ConnectionState;
