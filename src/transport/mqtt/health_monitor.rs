//! Pure reconnection logic for the session worker
//!
//! Decides whether and when to reconnect, maps connection events onto
//! [`ConnectionState`] values and logs transitions. No I/O happens here.

use super::connection::{ConnectionState, ReconnectConfig, TransportError};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide the next reconnection step (pure function)
    ///
    /// Transport failures are retried forever; only a shutdown request or an
    /// authentication refusal ends the loop. `jitter_sample` is a uniform
    /// value in `[-1, 1]`.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
        last_error: Option<&TransportError>,
        jitter_sample: f64,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(error) = last_error.filter(|e| e.is_auth_failure()) {
            return ReconnectionDecision::AbortAuthRejected(error.to_string());
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.jittered_delay(attempt, jitter_sample),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::SessionReady => ConnectionState::Connected,
            ConnectionEvent::ReconnectionScheduled(attempt) => {
                ConnectionState::Reconnecting(*attempt)
            }
            ConnectionEvent::AuthRejected(_) | ConnectionEvent::Stopped => {
                ConnectionState::Disconnected
            }
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, client_id: &str) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id, "MQTT session established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(attempt)) => {
                warn!(client_id, attempt, "MQTT connection lost, reconnecting");
            }
            (ConnectionState::Connecting, ConnectionState::Reconnecting(attempt)) => {
                warn!(client_id, attempt, "MQTT connect attempt failed");
            }
            (_, ConnectionState::Disconnected) => {
                info!(client_id, from = %from, "MQTT session stopped");
            }
            _ => {
                info!(client_id, "MQTT connection state: {} -> {}", from, to);
            }
        }
    }

    /// Log why a connection ended (pure logging function)
    pub fn log_connection_loss(error: &TransportError, client_id: &str) {
        let reason = crate::error::sanitize_error_message(&error.to_string());
        if error.is_auth_failure() {
            error!(client_id, %reason, "Broker rejected credentials");
        } else {
            warn!(client_id, %reason, "MQTT link failed");
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms`, then make connect attempt `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - broker refused the credentials
    AbortAuthRejected(String),
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connect attempt is starting
    ConnectStarted,
    /// CONNACK accepted and subscriptions replayed
    SessionReady,
    /// Link lost or attempt failed; backoff for attempt `n` started
    ReconnectionScheduled(u32),
    /// CONNACK return code 4 or 5
    AuthRejected(String),
    /// `stop()` was called
    Stopped,
}
