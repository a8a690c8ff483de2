//! Thread-safe client metrics
//!
//! Atomic counters for the connection, delivery and notification paths plus a
//! mutex-protected window of connect latencies. Each `SafetyClient` owns one
//! collector; [`ClientMetrics::snapshot`] produces a serializable view.

use crate::transport::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Per-client metrics collector
pub struct ClientMetrics {
    // Connection metrics
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    auth_rejections: AtomicU64,
    last_ping_response: AtomicU64,
    connection_start_time: AtomicU64,
    state_transitions: AtomicU64,

    // Delivery metrics
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    duplicates_suppressed: AtomicU64,
    delivery_failures: AtomicU64,
    persistence_degraded: AtomicBool,

    // Notification metrics
    notifications_shown: AtomicU64,
    notifications_suppressed: AtomicU64,
    malformed_events: AtomicU64,

    connect_latencies: Mutex<Vec<u64>>, // in milliseconds
    created_at: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            last_ping_response: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            persistence_degraded: AtomicBool::new(false),
            notifications_shown: AtomicU64::new(0),
            notifications_suppressed: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
            connect_latencies: Mutex::new(Vec::new()),
            created_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self, latency: Duration) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_connect_latency(latency);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_rejected(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn ping_response(&self) {
        self.last_ping_response
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        if state != ConnectionState::Connected {
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    fn record_connect_latency(&self, latency: Duration) {
        if let Ok(mut latencies) = self.connect_latencies.lock() {
            latencies.push(latency.as_millis() as u64);

            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    // Delivery metrics
    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound QoS 2 redelivery acknowledged without dispatch
    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Outbound message dropped after exhausting its retries
    pub fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_degraded(&self) {
        self.persistence_degraded.store(true, Ordering::Relaxed);
    }

    // Notification metrics
    pub fn notification_shown(&self) {
        self.notifications_shown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_suppressed(&self) {
        self.notifications_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_event(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Connect latency statistics: (avg, p50, p95, p99)
    fn latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(latencies) = self.connect_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_connect_ms, p50, p95, p99) = self.latency_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                last_ping_response: self.last_ping_response.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
                avg_connect_time_ms: avg_connect_ms,
                connect_time_p50_ms: p50,
                connect_time_p95_ms: p95,
                connect_time_p99_ms: p99,
            },
            delivery: DeliveryMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
                persistence_degraded: self.persistence_degraded.load(Ordering::Relaxed),
            },
            notifications: NotificationMetrics {
                shown: self.notifications_shown.load(Ordering::Relaxed),
                suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
                malformed_events: self.malformed_events.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.created_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub delivery: DeliveryMetrics,
    pub notifications: NotificationMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub auth_rejections: u64,
    pub state_transitions: u64,
    pub last_ping_response: u64,
    pub connection_duration_seconds: u64,
    pub avg_connect_time_ms: f64,
    pub connect_time_p50_ms: f64,
    pub connect_time_p95_ms: f64,
    pub connect_time_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub duplicates_suppressed: u64,
    pub delivery_failures: u64,
    pub persistence_degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationMetrics {
    pub shown: u64,
    pub suppressed: u64,
    pub malformed_events: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
