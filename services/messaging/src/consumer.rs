//! Kafka consumer that hands each message to an async [`MessageHandler`].
//!
//! Offsets are committed per message once the handler returns. A handler
//! error routes the payload to the dead letter topic (when a DLQ producer is
//! configured) and then commits, so a poison message never blocks its
//! partition. When the DLQ send itself fails the offset is left uncommitted
//! and the message is redelivered after a rebalance or restart.

use crate::config::KafkaConfig;
use crate::producer::PrismProducer;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Where a message came from
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Build a message outside of Kafka (replays, tests)
    pub fn from_payload(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: MessageMetadata {
                topic: topic.into(),
                partition: 0,
                offset: 0,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    pub fn key_str(&self) -> Option<&str> {
        self.metadata
            .key
            .as_deref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when [`MessageHandler::handle`] fails, before dead-lettering
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Kafka consumer wrapper
pub struct PrismConsumer {
    consumer: StreamConsumer,
    config: KafkaConfig,
    shutdown_tx: broadcast::Sender<()>,
    dlq_producer: Option<Arc<PrismProducer>>,
}

impl PrismConsumer {
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .consumer_client_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config,
            shutdown_tx,
            dlq_producer: None,
        })
    }

    /// Route failed messages to the dead letter topic
    pub fn with_dlq_producer(mut self, producer: Arc<PrismProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    pub fn subscribe_uploads(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.uploads.as_str()])
    }

    /// Handle that stops [`PrismConsumer::run`] after the in-flight message
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Consume until shutdown, dispatching each message to `handler`
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(borrowed)) => {
                            self.dispatch(&borrowed, handler.as_ref()).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch<H: MessageHandler + ?Sized>(&self, borrowed: &BorrowedMessage<'_>, handler: &H) {
        let incoming = convert_message(borrowed);

        debug!(
            topic = %incoming.metadata.topic,
            partition = incoming.metadata.partition,
            offset = incoming.metadata.offset,
            "Received message"
        );

        let handled = match handler.handle(&incoming).await {
            Ok(()) => true,
            Err(e) => {
                handler.on_error(&incoming, &e).await;
                self.dead_letter(&incoming, &e).await
            }
        };

        if handled {
            if let Err(e) = self.consumer.commit_message(borrowed, CommitMode::Async) {
                warn!(error = %e, "Failed to commit offset");
            }
        }
    }

    /// Returns true when the message is safe to commit
    async fn dead_letter(&self, incoming: &IncomingMessage, cause: &ConsumerError) -> bool {
        let Some(ref dlq) = self.dlq_producer else {
            return true;
        };

        match dlq
            .send_to_dlq(&incoming.metadata.topic, &incoming.payload, &cause.to_string())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to send to DLQ");
                false
            }
        }
    }
}

fn convert_message<M: Message>(msg: &M) -> IncomingMessage {
    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(Ok(value)) = header.value.map(std::str::from_utf8) {
                headers.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    IncomingMessage {
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_decode_json_payload() {
        let message = IncomingMessage::from_payload("prism.uploads", br#"{"n": 7}"#.to_vec());
        let ping: Ping = message.decode_json().unwrap();
        assert_eq!(ping.n, 7);
    }

    #[test]
    fn test_decode_json_reports_deserialization_error() {
        let message = IncomingMessage::from_payload("prism.uploads", b"not json".to_vec());
        let result = message.decode_json::<Ping>();
        assert!(matches!(result, Err(ConsumerError::DeserializationError(_))));
    }

    #[test]
    fn test_key_and_headers() {
        let mut message = IncomingMessage::from_payload("prism.uploads", Vec::new());
        message.metadata.key = Some(b"uploads/abc.jpg".to_vec());
        message
            .metadata
            .headers
            .insert("message-type".to_string(), "object_created".to_string());

        assert_eq!(message.key_str(), Some("uploads/abc.jpg"));
        assert_eq!(message.header("message-type"), Some("object_created"));
        assert_eq!(message.header("missing"), None);
    }
}
