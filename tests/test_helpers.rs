//! Test helpers and utilities for integration tests

use safewatch::testing::{MockConnector, RecordingNotifier};
use safewatch::{ClientConfig, SafetyClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything the worker does in response to a packet
#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(5);

/// Fast-reconnecting configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> ClientConfig {
    ClientConfig::from_toml_str(
        r#"
[broker]
url = "tcp://localhost:1883"
client_id = "safewatch-it"
keep_alive_secs = 30
clean_session = false

[reconnect]
base_delay_ms = 10
max_delay_ms = 40
"#,
    )
    .expect("test config should parse")
}

/// Same as [`test_config`] with the delivery queue stored under `dir`
#[allow(dead_code)]
pub fn persistent_config(dir: &Path) -> ClientConfig {
    let mut config = test_config();
    config.delivery.store_path = Some(dir.join("delivery"));
    config
}

/// Client wired to a mock broker and a recording notifier
#[allow(dead_code)]
pub fn mock_client(
    config: ClientConfig,
) -> (SafetyClient, MockConnector, Arc<RecordingNotifier>) {
    let connector = MockConnector::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let client = SafetyClient::with_notifier(config, Arc::new(connector.clone()), notifier.clone())
        .expect("client should build");
    (client, connector, notifier)
}

/// Poll `condition` until it holds or [`WAIT`] elapses
#[allow(dead_code)]
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
