//! Turns "object created" notifications into pipeline runs.
//!
//! Delivery is at-least-once. Seeding is insert-if-absent, so a duplicate
//! notification never resets a record that is already progressing, and a
//! per-image lease keeps a second run from starting while the first one is
//! alive. Runs execute on background tasks bounded by a semaphore; the
//! consumer only waits for a free slot, not for the run.

use crate::config::PipelineConfig;
use crate::error::MetadataError;
use crate::metadata_store::MetadataStore;
use crate::model::{ImageRecord, ImageStatus};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use prism_messaging::{ConsumerError, IncomingMessage, MessageHandler};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("unrecognised trigger payload: {0}")]
    Malformed(String),

    #[error("trigger payload has an empty {0}")]
    Empty(&'static str),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] MetadataError),

    #[error("ingestor is shutting down")]
    ShuttingDown,
}

/// A new upload, as announced by the trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    pub image_key: String,
    pub bucket: String,
    pub size: u64,
    pub content_type: String,
}

#[derive(Deserialize)]
struct BucketRef {
    name: String,
}

#[derive(Deserialize)]
struct ObjectRef {
    key: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "content-type")]
    content_type: Option<String>,
}

/// The two detail shapes upstream sources produce
#[derive(Deserialize)]
#[serde(untagged)]
enum TriggerDetail {
    /// Storage event: `{ bucket: { name }, object: { key, size } }`
    StorageEvent { bucket: BucketRef, object: ObjectRef },
    /// Flat: `{ imageKey, bucket, size?, contentType? }`
    Direct {
        #[serde(rename = "imageKey")]
        image_key: String,
        bucket: String,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default, rename = "contentType")]
        content_type: Option<String>,
    },
}

/// A detail either wrapped in an event envelope or sent bare
#[derive(Deserialize)]
#[serde(untagged)]
enum TriggerPayload {
    Envelope { detail: TriggerDetail },
    Bare(TriggerDetail),
}

impl ObjectCreated {
    pub fn parse(payload: &[u8]) -> Result<Self, TriggerError> {
        let parsed: TriggerPayload =
            serde_json::from_slice(payload).map_err(|e| TriggerError::Malformed(e.to_string()))?;

        let detail = match parsed {
            TriggerPayload::Envelope { detail } | TriggerPayload::Bare(detail) => detail,
        };

        let (image_key, bucket, size, content_type) = match detail {
            TriggerDetail::StorageEvent { bucket, object } => {
                (object.key, bucket.name, object.size, object.content_type)
            }
            TriggerDetail::Direct {
                image_key,
                bucket,
                size,
                content_type,
            } => (image_key, bucket, size, content_type),
        };

        if image_key.trim().is_empty() {
            return Err(TriggerError::Empty("imageKey"));
        }
        if bucket.trim().is_empty() {
            return Err(TriggerError::Empty("bucket"));
        }

        Ok(Self {
            image_key,
            bucket,
            size: size.unwrap_or(0),
            content_type: content_type
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        })
    }
}

/// What happened to one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestDecision {
    Started,
    /// Another run holds the lease
    Duplicate,
    AlreadyFinished(ImageStatus),
}

pub struct Ingestor {
    orchestrator: Arc<Orchestrator>,
    records: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl Ingestor {
    pub fn new(orchestrator: Arc<Orchestrator>, records: Arc<dyn MetadataStore>, config: &PipelineConfig) -> Self {
        Self {
            orchestrator,
            records,
            retry: RetryPolicy::from_config(config),
            lease_ttl: config.lease_ttl(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Seed the record and start a run for it
    #[instrument(skip(self, trigger), fields(image_key = %trigger.image_key))]
    pub async fn ingest(&self, trigger: ObjectCreated) -> Result<IngestDecision, IngestError> {
        metrics::counter!("ingest.messages.received").increment(1);

        let seed = ImageRecord::processing(
            &trigger.image_key,
            &trigger.bucket,
            &trigger.content_type,
            trigger.size,
        );
        let inserted = self.with_store_retry(|| self.records.create(&seed)).await?;

        let request = if inserted {
            debug!("Image record created");
            RunRequest::from(&seed)
        } else {
            match self.with_store_retry(|| self.records.get(&trigger.image_key)).await? {
                Some(existing) if existing.status.is_terminal() => {
                    metrics::counter!("ingest.messages.already_finished").increment(1);
                    info!(status = %existing.status, "Image already processed, ignoring notification");
                    return Ok(IngestDecision::AlreadyFinished(existing.status));
                }
                Some(existing) => RunRequest::from(&existing),
                None => RunRequest::from(&seed),
            }
        };

        self.launch(request).await
    }

    /// Take a run slot and the image lease, then run in the background
    async fn launch(&self, request: RunRequest) -> Result<IngestDecision, IngestError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::ShuttingDown)?;

        let owner = Uuid::new_v4();
        let leased = self
            .with_store_retry(|| self.records.acquire_lease(&request.image_key, owner, self.lease_ttl))
            .await?;
        if !leased {
            metrics::counter!("ingest.messages.duplicate").increment(1);
            info!(image_key = %request.image_key, "Run already in flight, skipping duplicate");
            return Ok(IngestDecision::Duplicate);
        }

        let orchestrator = self.orchestrator.clone();
        let records = self.records.clone();
        self.tasks.spawn(async move {
            let _permit = permit;

            match orchestrator.run(&request).await {
                Ok(report) => info!(
                    image_key = %report.image_key,
                    outcome = report.outcome.label(),
                    "Run finished"
                ),
                Err(e) => error!(image_key = %request.image_key, error = %e, "Run aborted"),
            }

            if let Err(e) = records.release_lease(&request.image_key, owner).await {
                warn!(image_key = %request.image_key, error = %e, "Failed to release run lease");
            }
        });

        Ok(IngestDecision::Started)
    }

    /// Restart runs whose record has not moved for `stalled_after`
    pub async fn recover_stalled(&self, stalled_after: Duration, batch_size: i64) -> Result<usize, IngestError> {
        let stalled_after =
            chrono::Duration::from_std(stalled_after).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = chrono::Utc::now() - stalled_after;

        let stalled = self.records.find_stalled(cutoff, batch_size).await?;
        let mut restarted = 0;
        for record in &stalled {
            if self.launch(RunRequest::from(record)).await? == IngestDecision::Started {
                restarted += 1;
            }
        }

        if restarted > 0 {
            metrics::counter!("ingest.runs.recovered").increment(restarted as u64);
            info!(restarted, "Restarted stalled runs");
        }
        Ok(restarted)
    }

    /// Periodic recovery sweep until `cancel` fires
    pub async fn run_recovery(
        self: Arc<Self>,
        every: Duration,
        stalled_after: Duration,
        batch_size: i64,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_stalled(stalled_after, batch_size).await {
                        warn!(error = %e, "Stalled run sweep failed");
                    }
                }
            }
        }

        debug!("Recovery loop stopped");
    }

    /// Wait for every run started so far
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop accepting runs and wait for in-flight ones
    pub async fn shutdown(&self) {
        self.permits.close();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn with_store_retry<T, F, Fut>(&self, mut op: F) -> Result<T, MetadataError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MetadataError>>,
    {
        backoff::future::retry(self.retry.bounded_backoff(), || {
            let call = op();
            async move {
                call.await.map_err(|e| {
                    if e.is_transient() {
                        warn!(error = %e, "Transient metadata store error, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

#[async_trait]
impl MessageHandler for Ingestor {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let trigger = ObjectCreated::parse(&message.payload).map_err(|e| {
            metrics::counter!("ingest.messages.invalid").increment(1);
            ConsumerError::DeserializationError(e.to_string())
        })?;

        self.ingest(trigger)
            .await
            .map(|_| ())
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_payload() {
        let trigger = ObjectCreated::parse(
            br#"{"imageKey":"uploads/abc.jpg","bucket":"prism-uploads","size":2048,"contentType":"image/png"}"#,
        )
        .unwrap();

        assert_eq!(
            trigger,
            ObjectCreated {
                image_key: "uploads/abc.jpg".to_string(),
                bucket: "prism-uploads".to_string(),
                size: 2048,
                content_type: "image/png".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_envelope_with_storage_event_detail() {
        let trigger = ObjectCreated::parse(
            br#"{
                "version": "0",
                "detail-type": "Object Created",
                "detail": {
                    "bucket": { "name": "prism-uploads" },
                    "object": { "key": "uploads/abc.jpg", "size": 512 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(trigger.image_key, "uploads/abc.jpg");
        assert_eq!(trigger.bucket, "prism-uploads");
        assert_eq!(trigger.size, 512);
        assert_eq!(trigger.content_type, "image/jpeg");
    }

    #[test]
    fn test_parse_envelope_with_direct_detail() {
        let trigger = ObjectCreated::parse(
            br#"{"detail":{"imageKey":"uploads/x.gif","bucket":"prism-uploads"}}"#,
        )
        .unwrap();

        assert_eq!(trigger.image_key, "uploads/x.gif");
        assert_eq!(trigger.size, 0);
        assert_eq!(trigger.content_type, "image/jpeg");
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        assert!(matches!(
            ObjectCreated::parse(br#"{"key":"uploads/abc.jpg"}"#),
            Err(TriggerError::Malformed(_))
        ));
        assert!(matches!(
            ObjectCreated::parse(b"not json"),
            Err(TriggerError::Malformed(_))
        ));
        assert!(matches!(
            ObjectCreated::parse(br#"{"imageKey":"","bucket":"b"}"#),
            Err(TriggerError::Empty("imageKey"))
        ));
    }
}
