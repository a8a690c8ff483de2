//! Observability: structured logging setup and per-client metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{ClientMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{delivery_span, mqtt_span, notification_span};
