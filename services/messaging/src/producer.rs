//! JSON producer for notification and dead-letter topics.

use crate::config::KafkaConfig;
use base64::{engine::general_purpose::STANDARD, Engine};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer flush timed out after {0:?}")]
    Timeout(Duration),
}

/// Where a message landed
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key; image keys keep per-image ordering
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a message with a JSON payload
    pub fn json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;

        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, message_type: impl Into<String>) -> Self {
        self.with_header("message-type", message_type)
    }
}

/// Kafka producer wrapper
pub struct PrismProducer {
    producer: FutureProducer,
    config: KafkaConfig,
    timeout: Duration,
}

impl PrismProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(brokers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .producer_client_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let timeout = config.request_timeout();

        Ok(Self {
            producer,
            config,
            timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for the broker acknowledgement
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);

        if let Some(ref key) = message.key {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, size = message.payload.len(), "Message delivered");

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
        })
    }

    /// Publish a JSON document to the notifications topic, keyed for per-key ordering
    pub async fn send_notification<T: serde::Serialize>(
        &self,
        key: &str,
        message_type: &str,
        notification: &T,
    ) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::json(&self.config.topics.notifications, notification)?
            .with_key(key)
            .with_message_type(message_type);

        self.send(message).await
    }

    /// Forward an unprocessable message to the dead letter topic
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let dlq_message = serde_json::json!({
            "original_topic": original_topic,
            "original_message_base64": STANDARD.encode(original_message),
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let message = OutgoingMessage::json(&self.config.topics.dead_letter_queue, &dlq_message)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", original_topic)
            .with_header("error-reason", error);

        self.send(message).await
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for PrismProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_message_builder() {
        let message = OutgoingMessage::json("prism.notifications", &serde_json::json!({"a": 1}))
            .unwrap()
            .with_key("uploads/abc.jpg")
            .with_message_type("image_completed");

        assert_eq!(message.key.as_deref(), Some("uploads/abc.jpg"));
        assert_eq!(message.headers, vec![("message-type".to_string(), "image_completed".to_string())]);
        assert_eq!(message.payload, br#"{"a":1}"#.to_vec());
    }
}
