//! Prism Processor
//!
//! Image ingestion pipeline for the Prism photo platform. Every uploaded
//! image runs through a fixed stage DAG: its byte signature is validated,
//! its structural metadata extracted, two renditions produced in parallel,
//! and the original plus renditions archived under a date-partitioned
//! prefix. Per-stage progress is persisted so callers can poll it and a
//! restarted run can resume where the last one stopped.
//!
//! ## Features
//!
//! - **Byte-level validation**: JPEG, PNG, GIF and WEBP are recognised from
//!   the first 12 bytes; anything else is rejected before decoding
//! - **Durable stage tracking**: PostgreSQL-backed records, one JSONB entry
//!   per stage, completed stages are never re-run
//! - **Bounded retries**: transient object-store failures are retried with
//!   exponential backoff inside a per-run wall-clock budget
//! - **Run leases and recovery**: duplicate notifications are dropped while a
//!   run holds the image's lease; stalled runs are restarted periodically
//! - **HTTP API**: presigned upload URLs and status polling
//!
//! ## Architecture
//!
//! ```text
//! Kafka                       S3 (uploads)              PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ prism.uploads│           │ uploads/     │          │ image_records│
//! └──────────────┘           │ processed/   │          └──────────────┘
//!        │                   └──────────────┘                 ▲
//!        ▼                          ▲                         │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Ingestor     │──────────▶│ Orchestrator │────────────────┘
//! └──────────────┘           └──────────────┘
//!                                   │
//!                     ┌─────────────┴─────────────┐
//!                     ▼                           ▼
//!              ┌──────────────┐           ┌──────────────┐
//!              │ S3 (archive) │           │ prism.       │
//!              │ archive/     │           │ notifications│
//!              └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod memory;
pub mod metadata_store;
pub mod model;
pub mod notifier;
pub mod object_store;
pub mod orchestrator;
pub mod retry;
pub mod stages;

pub use api::{AppState, UploadUrlResponse};
pub use codec::{ImageCodec, RasterCodec, Rendition};
pub use config::Config;
pub use error::{CodecError, MetadataError, ObjectStoreError, StageError};
pub use ingestion::{IngestDecision, Ingestor, ObjectCreated};
pub use metadata_store::{MetadataStore, PostgresMetadataStore, RecordQuery, StatusUpdate};
pub use model::{ImageFormat, ImageMetadata, ImageRecord, ImageStatus, StageName, StageRecord, StageStatus};
pub use notifier::{KafkaNotifier, Notification, NotificationSink};
pub use object_store::{ByteRange, ObjectStore, S3ObjectStore};
pub use orchestrator::{Orchestrator, PipelineDeps, RunOutcome, RunReport, RunRequest};
pub use retry::RetryPolicy;
