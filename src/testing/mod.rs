//! Testing utilities and mock implementations
//!
//! Lets the session, delivery and notification paths run end to end without
//! a real MQTT broker.

pub mod mocks;

pub use mocks::*;
