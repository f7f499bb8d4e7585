//! Prism Messaging - Kafka plumbing for the image ingestion pipeline
//!
//! This library wraps `rdkafka` with the three flows the processor needs:
//!
//! - consuming "object created" notifications from the uploads topic,
//! - publishing terminal success/failure notifications,
//! - dead-lettering trigger messages that cannot be handled.
//!
//! # Example
//!
//! ```rust,no_run
//! use prism_messaging::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
//!         println!("{} bytes", message.payload.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KafkaConfig::default();
//!     let dlq = Arc::new(PrismProducer::new(config.clone())?);
//!     let consumer = PrismConsumer::new(config)?.with_dlq_producer(dlq);
//!     consumer.subscribe_uploads()?;
//!     consumer.run(Arc::new(Printer)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod producer;

pub use config::{ConfigError, KafkaConfig, SecurityConfig, SecurityProtocol, TopicConfig};
pub use consumer::{ConsumerError, IncomingMessage, MessageHandler, MessageMetadata, PrismConsumer};
pub use producer::{DeliveryResult, OutgoingMessage, PrismProducer, ProducerError};

/// Re-exported so handler implementations do not need their own dependency
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_trait;
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{ConsumerError, IncomingMessage, MessageHandler, PrismConsumer};
    pub use crate::producer::{OutgoingMessage, PrismProducer, ProducerError};
}
