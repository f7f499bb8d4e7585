//! Kafka connection settings shared by the Prism consumer and producer.
//!
//! The same [`KafkaConfig`] is embedded in the processor's service
//! configuration, so every field has a serde default and the struct can be
//! loaded from a partial TOML table or from `__`-separated environment keys.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while validating messaging configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for broker connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// Credentials and certificates for secured clusters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Path to CA certificate file
    pub ssl_ca_location: Option<String>,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

/// Topic names used by the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// "Object created" notifications that start a pipeline run
    #[serde(default = "default_uploads_topic")]
    pub uploads: String,
    /// Terminal success/failure notifications
    #[serde(default = "default_notifications_topic")]
    pub notifications: String,
    /// Trigger messages that could not be handled
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_uploads_topic() -> String {
    "prism.uploads".to_string()
}

fn default_notifications_topic() -> String {
    "prism.notifications".to_string()
}

fn default_dlq_topic() -> String {
    "prism.uploads.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            uploads: default_uploads_topic(),
            notifications: default_notifications_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Consumer group for the uploads topic
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Must exceed the pipeline run budget, or the broker evicts a busy consumer
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "prism-processor".to_string()
}

fn default_group_id() -> String {
    "prism-processor".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_max_poll_interval_ms() -> u64 {
    600000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            security: SecurityConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security.protocol.as_str());

        if let Some(ref ca) = self.security.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security.protocol.uses_sasl() {
            config.set("sasl.mechanism", &self.security.sasl_mechanism);
            if let Some(ref username) = self.security.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.security.sasl_password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Producer settings: idempotent, fully acknowledged delivery
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();

        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "lz4")
            .set("message.timeout.ms", self.request_timeout_ms.to_string());

        config
    }

    /// Consumer settings: offsets are committed manually once a message is handled
    pub fn consumer_client_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();

        config
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }

        if self.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }

        if self.security.protocol.uses_sasl() && self.security.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.security.sasl_username (required for SASL)".to_string(),
            ));
        }

        if self.topics.uploads == self.topics.dead_letter_queue {
            return Err(ConfigError::InvalidValue {
                key: "kafka.topics.dead_letter_queue".to_string(),
                message: "must differ from the uploads topic".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.topics.uploads, "prism.uploads");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig::new("broker:9092");
        let client = config.consumer_client_config();

        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("group.id"), Some("prism-processor"));
    }

    #[test]
    fn test_sasl_settings_only_for_sasl_protocols() {
        let mut config = KafkaConfig::default();
        assert!(config.producer_client_config().get("sasl.mechanism").is_none());

        config.security.protocol = SecurityProtocol::SaslSsl;
        config.security.sasl_username = Some("svc".to_string());
        let client = config.producer_client_config();
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("sasl.username"), Some("svc"));
    }

    #[test]
    fn test_sasl_without_username_is_rejected() {
        let mut config = KafkaConfig::default();
        config.security.protocol = SecurityProtocol::SaslPlaintext;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_dlq_must_differ_from_uploads() {
        let mut config = KafkaConfig::default();
        config.topics.dead_letter_queue = config.topics.uploads.clone();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
