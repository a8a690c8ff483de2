//! Client configuration
//!
//! Loaded from TOML (`ClientConfig::load_from_file`) or built in code from
//! `ClientConfig::default()`. Every section and field has a default, so an
//! empty file yields a client for the public HiveMQ broker subscribed to
//! `iot/notifications`. Broker credentials are never stored in the file:
//! `username_env` / `password_env` name environment variables that are read
//! at connect time.

use crate::protocol::{validate_topic_filter, QoS};
use crate::transport::{BrokerAddress, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_BROKER_URL: &str = "tcp://broker.hivemq.com:1883";
pub const DEFAULT_NOTIFICATION_TOPIC: &str = "iot/notifications";
pub const DEFAULT_NOTIFICATION_TITLE: &str = "CHILD SAFETY ALERT";

const MAX_CLIENT_ID_LEN: usize = 128;
const MIN_PACKET_SIZE: usize = 64;

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub notifications: NotificationSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URL
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Fixed client identifier; generated per client when absent
    #[serde(default)]
    pub client_id: Option<String>,
    /// Environment variable containing the user name
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable containing the password
    #[serde(default)]
    pub password_env: Option<String>,
    /// Keep-alive interval, 0 disables pinging
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Largest inbound packet accepted, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default)]
    pub tls: Option<TlsSection>,
}

/// TLS material for `ssl://` and `mqtts://` brokers
///
/// Without a CA file the bundled webpki roots are trusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Overrides the host name used for certificate verification
    pub server_name: Option<String>,
}

/// Outbound delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySection {
    /// sled database directory; in-memory queue when absent
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Retransmissions allowed before a message is reported as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum number of unacknowledged outbound messages
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

/// Notification dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSection {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// How long a dedup record is kept before eviction
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
    #[serde(default = "default_history_retention_hours")]
    pub history_retention_hours: u64,
    #[serde(default = "default_title")]
    pub title: String,
    /// Topics the dispatcher is subscribed to when the client is built
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_notification_qos")]
    pub qos: QoS,
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_queued() -> usize {
    1000
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_record_ttl_secs() -> u64 {
    600
}

fn default_history_retention_hours() -> u64 {
    24
}

fn default_title() -> String {
    DEFAULT_NOTIFICATION_TITLE.to_string()
}

fn default_topics() -> Vec<String> {
    vec![DEFAULT_NOTIFICATION_TOPIC.to_string()]
}

fn default_notification_qos() -> QoS {
    QoS::AtLeastOnce
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_packet_size: default_max_packet_size(),
            tls: None,
        }
    }
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            store_path: None,
            max_retries: default_max_retries(),
            max_queued: default_max_queued(),
        }
    }
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            record_ttl_secs: default_record_ttl_secs(),
            history_retention_hours: default_history_retention_hours(),
            title: default_title(),
            topics: default_topics(),
            qos: default_notification_qos(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        self.reconnect.validate().map_err(ConfigError::InvalidConfig)?;

        if self.delivery.max_queued == 0 {
            return Err(ConfigError::invalid("delivery.max_queued must be at least 1"));
        }

        let notifications = &self.notifications;
        if notifications.dedup_window_secs > notifications.record_ttl_secs {
            return Err(ConfigError::invalid(format!(
                "notifications.dedup_window_secs ({}) cannot exceed record_ttl_secs ({})",
                notifications.dedup_window_secs, notifications.record_ttl_secs
            )));
        }
        if notifications.title.trim().is_empty() {
            return Err(ConfigError::invalid("notifications.title cannot be empty"));
        }
        for topic in &notifications.topics {
            validate_topic_filter(topic).map_err(|e| {
                ConfigError::invalid(format!("notifications.topics entry '{topic}': {e}"))
            })?;
        }

        Ok(())
    }

    /// Configured client ID, or a freshly generated one
    pub fn resolve_client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "safewatch-test"
keep_alive_secs = 30

[reconnect]
base_delay_ms = 10
max_delay_ms = 100
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

impl BrokerSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let address = BrokerAddress::parse(&self.url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.url.clone()))?;

        if let Some(client_id) = &self.client_id {
            validate_client_id(client_id)?;
        }

        if self.password_env.is_some() && self.username_env.is_none() {
            return Err(ConfigError::invalid(
                "broker.password_env requires broker.username_env",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "broker.connect_timeout_secs must be greater than 0",
            ));
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(ConfigError::invalid(format!(
                "broker.max_packet_size must be at least {MIN_PACKET_SIZE} bytes"
            )));
        }

        if let Some(tls) = &self.tls {
            if !address.tls {
                return Err(ConfigError::invalid(format!(
                    "[broker.tls] given for plain broker URL {}",
                    self.url
                )));
            }
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(ConfigError::invalid(
                    "broker.tls.client_cert and client_key must be set together",
                ));
            }
        }

        Ok(())
    }

    /// Helper method to read an optional environment variable
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Broker user name from the configured environment variable
    pub fn username(&self) -> Option<String> {
        Self::get_env_var_optional(self.username_env.as_ref())
    }

    /// Broker password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        Self::get_env_var_optional(self.password_env.as_ref())
    }
}

/// Generate a client ID of the form `safewatch-<13 hex digits>`
///
/// 23 characters, the longest identifier every MQTT 3.1.1 broker must accept.
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("safewatch-{}", &id[..13])
}

/// Validate client ID format: `[a-zA-Z0-9._-]+`, at most 128 characters
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]{{1,{MAX_CLIENT_ID_LEN}}}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();

        assert_eq!(config.broker.url, DEFAULT_BROKER_URL);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert!(config.broker.clean_session);
        assert_eq!(config.broker.max_packet_size, 256 * 1024);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.delivery.store_path, None);
        assert_eq!(config.notifications.dedup_window_secs, 60);
        assert_eq!(config.notifications.title, "CHILD SAFETY ALERT");
        assert_eq!(config.notifications.topics, vec!["iot/notifications"]);
        assert_eq!(config.notifications.qos, QoS::AtLeastOnce);
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "mqtts://broker.example.com"
client_id = "nursery-phone"
username_env = "SAFEWATCH_USER"
password_env = "SAFEWATCH_PASS"
keep_alive_secs = 0
clean_session = false
connect_timeout_secs = 5

[broker.tls]
ca_cert = "/etc/safewatch/ca.pem"

[reconnect]
base_delay_ms = 500
max_delay_ms = 30000
jitter = 0.1

[delivery]
store_path = "/var/lib/safewatch/queue"
max_retries = 3
max_queued = 50

[notifications]
dedup_window_secs = 30
title = "NURSERY ALERT"
topics = ["home/+/alerts", "iot/notifications"]
qos = 2
"#;

        let config = ClientConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.broker.client_id.as_deref(), Some("nursery-phone"));
        assert!(!config.broker.clean_session);
        assert_eq!(config.broker.keep_alive_secs, 0);
        assert_eq!(
            config.broker.tls.as_ref().unwrap().ca_cert,
            Some(PathBuf::from("/etc/safewatch/ca.pem"))
        );
        assert_eq!(config.reconnect.jitter, 0.1);
        assert_eq!(config.delivery.max_queued, 50);
        assert_eq!(config.notifications.topics.len(), 2);
        assert_eq!(config.notifications.qos, QoS::ExactlyOnce);
        assert_eq!(config.notifications.record_ttl_secs, 600);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("invalid@client").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id(&"a".repeat(MAX_CLIENT_ID_LEN + 1)).is_err());
        assert!(validate_client_id("valid-client_123.test").is_ok());
    }

    #[test]
    fn test_generated_client_id_shape() {
        let id = generate_client_id();
        assert!(id.starts_with("safewatch-"));
        assert_eq!(id.len(), 23);
        assert!(validate_client_id(&id).is_ok());
        assert_ne!(id, generate_client_id());
    }

    #[test]
    fn test_resolve_client_id_prefers_configured() {
        let config = ClientConfig::test_config();
        assert_eq!(config.resolve_client_id(), "safewatch-test");

        let generated = ClientConfig::default().resolve_client_id();
        assert!(generated.starts_with("safewatch-"));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let result = ClientConfig::from_toml_str("[broker]\nurl = \"http://broker:80\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_rejects_dedup_window_longer_than_ttl() {
        let toml_content = r#"
[notifications]
dedup_window_secs = 900
record_ttl_secs = 600
"#;
        let result = ClientConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_invalid_topic_filter() {
        let result = ClientConfig::from_toml_str("[notifications]\ntopics = [\"home/#/x\"]\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tls_on_plain_url() {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"

[broker.tls]
ca_cert = "ca.pem"
"#;
        assert!(ClientConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_rejects_half_client_certificate() {
        let toml_content = r#"
[broker]
url = "ssl://localhost"

[broker.tls]
client_cert = "client.pem"
"#;
        assert!(ClientConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_rejects_password_without_username() {
        let result = ClientConfig::from_toml_str("[broker]\npassword_env = \"PASS\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let toml_content = r#"
[reconnect]
base_delay_ms = 5000
max_delay_ms = 1000
"#;
        assert!(ClientConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_rejects_zero_queue_bound() {
        let result = ClientConfig::from_toml_str("[delivery]\nmax_queued = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_credentials_resolved_from_environment() {
        std::env::set_var("SAFEWATCH_CONFIG_TEST_USER", "parent");
        std::env::set_var("SAFEWATCH_CONFIG_TEST_PASS", "hunter2");

        let broker = BrokerSection {
            username_env: Some("SAFEWATCH_CONFIG_TEST_USER".to_string()),
            password_env: Some("SAFEWATCH_CONFIG_TEST_PASS".to_string()),
            ..BrokerSection::default()
        };

        assert_eq!(broker.username().as_deref(), Some("parent"));
        assert_eq!(broker.password().as_deref(), Some("hunter2"));

        std::env::remove_var("SAFEWATCH_CONFIG_TEST_USER");
        std::env::remove_var("SAFEWATCH_CONFIG_TEST_PASS");
    }

    #[test]
    fn test_missing_environment_variable_yields_none() {
        let broker = BrokerSection {
            username_env: Some("SAFEWATCH_DEFINITELY_UNSET_VAR".to_string()),
            ..BrokerSection::default()
        };
        assert_eq!(broker.username(), None);
    }
}
