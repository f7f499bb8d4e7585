//! Stage sequencing for one image.
//!
//! ```text
//! Validate -> Metadata -> [Resize, Thumbnail] -> Archive
//! ```
//!
//! The orchestrator holds no per-image state between runs. Everything it
//! needs to resume lives in the [`MetadataStore`]: a stage whose entry is
//! already `COMPLETED` is not re-invoked, and its recorded payload is read
//! back instead. Every attempt is bracketed by an `IN_PROGRESS` write and a
//! `COMPLETED`/`FAILED` write, and each write is awaited before the next
//! dependent stage starts.
//!
//! A run has a wall-clock budget. The deadline is checked before each
//! attempt and before each backoff sleep; a stage already executing is
//! allowed to finish its write. When the budget runs out the run is
//! abandoned and the record stays `PROCESSING` for the recovery sweep.

use crate::codec::ImageCodec;
use crate::config::PipelineConfig;
use crate::error::{MetadataError, StageError};
use crate::metadata_store::{MetadataStore, StatusUpdate};
use crate::model::{ImageMetadata, ImageRecord, ImageStatus, StageName, StageRecord};
use crate::notifier::{Notification, NotificationSink};
use crate::object_store::ObjectStore;
use crate::retry::RetryPolicy;
use crate::stages::{
    resized_key, thumbnail_key, ArchiveStage, DerivedKey, ImageRef, MetadataStage, Renditions,
    ResizeStage, StageOutput, ThumbnailStage, ValidateStage,
};
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Input for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub image_key: String,
    pub bucket: String,
    pub upload_timestamp: DateTime<Utc>,
    pub content_type: String,
    pub size: u64,
}

impl From<&ImageRecord> for RunRequest {
    fn from(record: &ImageRecord) -> Self {
        Self {
            image_key: record.image_key.clone(),
            bucket: record.bucket.clone(),
            upload_timestamp: record.upload_timestamp,
            content_type: record.content_type.clone(),
            size: record.size,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { archived_location: String },
    Failed { stage: StageName, error_message: String },
    Rejected { error_message: String },
    /// Run budget exhausted before `stage` could finish
    Abandoned { stage: StageName },
    /// The record was already terminal; nothing was done
    AlreadyFinished(ImageStatus),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Rejected { .. } => "rejected",
            RunOutcome::Abandoned { .. } => "abandoned",
            RunOutcome::AlreadyFinished(_) => "already_finished",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub image_key: String,
    /// Run start; the archive date partition is taken from it
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

/// The run could not record its own outcome
#[derive(Error, Debug)]
pub enum RunError {
    #[error("metadata store failure for {image_key}: {source}")]
    Store {
        image_key: String,
        #[source]
        source: MetadataError,
    },
}

/// Collaborators the pipeline runs against
pub struct PipelineDeps {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn MetadataStore>,
    pub codec: Arc<dyn ImageCodec>,
    pub notifier: Arc<dyn NotificationSink>,
}

struct RunContext {
    image: ImageRef,
    started_at: DateTime<Utc>,
    deadline: Instant,
}

impl RunContext {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

struct StageFailure {
    stage: StageName,
    error: StageError,
    at: DateTime<Utc>,
}

/// Why a run stopped advancing the DAG
enum Halt {
    Failed(StageFailure),
    Abandoned(StageName),
}

pub struct Orchestrator {
    records: Arc<dyn MetadataStore>,
    notifier: Arc<dyn NotificationSink>,
    validate: ValidateStage,
    metadata: MetadataStage,
    resize: ResizeStage,
    thumbnail: ThumbnailStage,
    archive: ArchiveStage,
    retry: RetryPolicy,
    run_budget: Duration,
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps, config: &PipelineConfig, archive_bucket: impl Into<String>) -> Self {
        let PipelineDeps {
            objects,
            records,
            codec,
            notifier,
        } = deps;

        Self {
            validate: ValidateStage::new(objects.clone()),
            metadata: MetadataStage::new(objects.clone(), codec.clone()),
            resize: ResizeStage::new(
                objects.clone(),
                codec.clone(),
                config.resize_max_width,
                config.resize_max_height,
            ),
            thumbnail: ThumbnailStage::new(
                objects.clone(),
                codec,
                config.thumbnail_width,
                config.thumbnail_height,
            ),
            archive: ArchiveStage::new(objects, archive_bucket),
            records,
            notifier,
            retry: RetryPolicy::from_config(config),
            run_budget: config.run_timeout(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_run_budget(mut self, run_budget: Duration) -> Self {
        self.run_budget = run_budget;
        self
    }

    /// Run the DAG for one image, resuming from whatever the record shows
    #[instrument(skip(self, request), fields(image_key = %request.image_key))]
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let ctx = RunContext {
            image: ImageRef::new(&request.image_key, &request.bucket),
            started_at,
            deadline: Instant::now() + self.run_budget,
        };
        let store_err = |source| RunError::Store {
            image_key: request.image_key.clone(),
            source,
        };

        let record = match self.records.get(&request.image_key).await.map_err(store_err)? {
            Some(record) => record,
            None => {
                let mut seeded = ImageRecord::processing(
                    &request.image_key,
                    &request.bucket,
                    &request.content_type,
                    request.size,
                );
                seeded.upload_timestamp = request.upload_timestamp;
                self.records.create(&seeded).await.map_err(store_err)?;
                seeded
            }
        };

        if record.status.is_terminal() {
            debug!(status = %record.status, "Record already terminal, skipping run");
            return Ok(self.report(&ctx, RunOutcome::AlreadyFinished(record.status)));
        }

        metrics::counter!("pipeline.runs.started").increment(1);
        let timer = Instant::now();

        let outcome = match self.advance(&ctx, &record).await {
            Ok(archived_location) => self.finish_completed(&ctx, archived_location).await,
            Err(Halt::Failed(failure)) => self.finish_failed(&ctx, failure).await,
            Err(Halt::Abandoned(stage)) => {
                warn!(
                    stage = %stage,
                    budget_secs = self.run_budget.as_secs(),
                    "Run budget exhausted, abandoning run"
                );
                Ok(RunOutcome::Abandoned { stage })
            }
        }
        .map_err(store_err)?;

        metrics::counter!("pipeline.runs.finished", "outcome" => outcome.label()).increment(1);
        metrics::histogram!("pipeline.run.duration_seconds").record(timer.elapsed().as_secs_f64());

        Ok(self.report(&ctx, outcome))
    }

    fn report(&self, ctx: &RunContext, outcome: RunOutcome) -> RunReport {
        RunReport {
            image_key: ctx.image.image_key.clone(),
            started_at: ctx.started_at,
            outcome,
        }
    }

    /// Walk the DAG; returns the archive location on success
    async fn advance(&self, ctx: &RunContext, record: &ImageRecord) -> Result<String, Halt> {
        let image = &ctx.image;

        if let Some(done) = record.completed_stage(StageName::Validation) {
            debug!(format = ?done.format, "Validation already completed");
        } else {
            self.run_stage(ctx, StageName::Validation, || self.validate.run(image))
                .await?;
        }

        let metadata: ImageMetadata = match record.completed_stage(StageName::Metadata) {
            Some(done) => done
                .metadata()
                .ok_or_else(|| missing_payload(StageName::Metadata))?,
            None => {
                self.run_stage(ctx, StageName::Metadata, || self.metadata.run(image))
                    .await?
            }
        };

        let resize = async {
            if let Some(done) = record.completed_stage(StageName::Resize) {
                let key = done
                    .output_key
                    .clone()
                    .unwrap_or_else(|| resized_key(&image.image_key));
                return Ok(DerivedKey(key));
            }
            self.run_stage(ctx, StageName::Resize, || self.resize.run(image, &metadata))
                .await
        };
        let thumbnail = async {
            if let Some(done) = record.completed_stage(StageName::Thumbnail) {
                let key = done
                    .output_key
                    .clone()
                    .unwrap_or_else(|| thumbnail_key(&image.image_key));
                return Ok(DerivedKey(key));
            }
            self.run_stage(ctx, StageName::Thumbnail, || {
                self.thumbnail.run(image, &metadata)
            })
            .await
        };

        let (resized, thumbnail) = match tokio::join!(resize, thumbnail) {
            (Ok(r), Ok(t)) => (r, t),
            (Err(a), Err(b)) => return Err(first_halt(a, b)),
            (Err(halt), Ok(_)) | (Ok(_), Err(halt)) => return Err(halt),
        };

        // The archive date partition is fixed by the run that first archived
        if let Some(done) = record.completed_stage(StageName::Archive) {
            debug!("Archive already completed");
            return done
                .output_key
                .clone()
                .ok_or_else(|| missing_payload(StageName::Archive));
        }

        let renditions = Renditions {
            resized: Some(resized.0),
            thumbnail: Some(thumbnail.0),
        };
        let date = ctx.started_at.date_naive();
        let location = self
            .run_stage(ctx, StageName::Archive, || {
                self.archive.run(image, &renditions, date)
            })
            .await?;

        Ok(location.0)
    }

    /// One stage with status bookkeeping and bounded retry
    async fn run_stage<T, F, Fut>(&self, ctx: &RunContext, stage: StageName, op: F) -> Result<T, Halt>
    where
        T: StageOutput,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let key = ctx.image.image_key.as_str();
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            if ctx.expired() {
                return Err(Halt::Abandoned(stage));
            }
            attempt += 1;
            metrics::counter!("pipeline.stage.attempts", "stage" => stage.as_str()).increment(1);

            let started = Instant::now();
            let err = match self.attempt(key, stage, attempt, &op).await {
                Ok(output) => {
                    metrics::histogram!("pipeline.stage.duration_seconds", "stage" => stage.as_str())
                        .record(started.elapsed().as_secs_f64());
                    debug!(stage = %stage, attempt, "Stage completed");
                    return Ok(output);
                }
                Err(err) => err,
            };

            let failed = StageRecord::failed(attempt, err.to_string());
            if let Err(e) = self.records.put_stage(key, stage, &failed).await {
                warn!(stage = %stage, error = %e, "Failed to record stage failure");
            }

            let retryable = err.is_retryable() && attempt < self.retry.max_attempts;
            if !retryable {
                metrics::counter!("pipeline.stage.failures", "stage" => stage.as_str(), "kind" => err.kind())
                    .increment(1);
                error!(stage = %stage, attempt, error = %err, "Stage failed");
                return Err(Halt::Failed(StageFailure {
                    stage,
                    error: err,
                    at: Utc::now(),
                }));
            }

            let delay = backoff.next_backoff().unwrap_or(self.retry.max_delay);
            if delay >= ctx.remaining() {
                return Err(Halt::Abandoned(stage));
            }

            metrics::counter!("pipeline.stage.retries", "stage" => stage.as_str()).increment(1);
            warn!(
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient stage failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `IN_PROGRESS`, the handler, then `COMPLETED` with its payload
    async fn attempt<T, F, Fut>(&self, key: &str, stage: StageName, attempt: u32, op: &F) -> Result<T, StageError>
    where
        T: StageOutput,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        self.records
            .put_stage(key, stage, &StageRecord::in_progress(attempt))
            .await?;

        let output = op().await?;

        self.records
            .put_stage(key, stage, &output.stage_record(attempt))
            .await?;

        Ok(output)
    }

    async fn finish_completed(
        &self,
        ctx: &RunContext,
        archived_location: String,
    ) -> Result<RunOutcome, MetadataError> {
        let key = &ctx.image.image_key;
        self.records
            .put_status(key, &StatusUpdate::completed(&archived_location))
            .await?;

        info!(archived_location = %archived_location, "Image processing completed");
        self.notify(Notification::completed(key, &archived_location)).await;

        Ok(RunOutcome::Completed { archived_location })
    }

    async fn finish_failed(&self, ctx: &RunContext, failure: StageFailure) -> Result<RunOutcome, MetadataError> {
        let key = &ctx.image.image_key;
        let status = failure.error.terminal_status();
        let error_message = failure.error.to_string();

        self.records
            .put_status(key, &StatusUpdate::failed(status, &error_message))
            .await?;

        warn!(
            stage = %failure.stage,
            status = %status,
            error = %error_message,
            "Image processing stopped"
        );
        self.notify(Notification::failed(key, failure.stage, &error_message))
            .await;

        Ok(match status {
            ImageStatus::Rejected => RunOutcome::Rejected { error_message },
            _ => RunOutcome::Failed {
                stage: failure.stage,
                error_message,
            },
        })
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification).await {
            metrics::counter!("pipeline.notifications.failed").increment(1);
            warn!(error = %e, "Failed to send notification");
        }
    }
}

/// A completed stage whose recorded payload cannot be read back
fn missing_payload(stage: StageName) -> Halt {
    Halt::Failed(StageFailure {
        stage,
        error: StageError::MissingInput(format!("completed {stage} stage has no payload")),
        at: Utc::now(),
    })
}

/// Of two parallel halts, the one to report
fn first_halt(a: Halt, b: Halt) -> Halt {
    match (a, b) {
        (Halt::Failed(x), Halt::Failed(y)) => Halt::Failed(if y.at < x.at { y } else { x }),
        (Halt::Failed(f), Halt::Abandoned(_)) | (Halt::Abandoned(_), Halt::Failed(f)) => Halt::Failed(f),
        (abandoned @ Halt::Abandoned(_), Halt::Abandoned(_)) => abandoned,
    }
}
