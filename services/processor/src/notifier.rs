//! Terminal outcome notifications.

use crate::model::{ImageStatus, StageName};
use async_trait::async_trait;
use prism_messaging::PrismProducer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
#[error("failed to publish notification: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedNotification {
    pub image_key: String,
    pub archived_location: String,
    pub status: ImageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedNotification {
    pub image_key: String,
    pub stage: StageName,
    pub error_message: String,
}

/// What a run reports when it reaches a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    Completed(CompletedNotification),
    Failed(FailedNotification),
}

impl Notification {
    pub fn completed(image_key: impl Into<String>, archived_location: impl Into<String>) -> Self {
        Notification::Completed(CompletedNotification {
            image_key: image_key.into(),
            archived_location: archived_location.into(),
            status: ImageStatus::Completed,
        })
    }

    pub fn failed(
        image_key: impl Into<String>,
        stage: StageName,
        error_message: impl Into<String>,
    ) -> Self {
        Notification::Failed(FailedNotification {
            image_key: image_key.into(),
            stage,
            error_message: error_message.into(),
        })
    }

    pub fn image_key(&self) -> &str {
        match self {
            Notification::Completed(n) => &n.image_key,
            Notification::Failed(n) => &n.image_key,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Notification::Completed(_) => "image_completed",
            Notification::Failed(_) => "image_failed",
        }
    }
}

/// Fire-and-forget channel for terminal outcomes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Publishes notifications to the Kafka notifications topic
pub struct KafkaNotifier {
    producer: Arc<PrismProducer>,
}

impl KafkaNotifier {
    pub fn new(producer: Arc<PrismProducer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotifier {
    #[instrument(skip(self, notification), fields(image_key = %notification.image_key()))]
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let delivery = self
            .producer
            .send_notification(
                notification.image_key(),
                notification.message_type(),
                notification,
            )
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        debug!(
            partition = delivery.partition,
            offset = delivery.offset,
            "Notification published"
        );
        Ok(())
    }
}
