mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{jpeg, Harness, UPLOADS};
use prism_messaging::{ConsumerError, IncomingMessage, MessageHandler};
use prism_processor::config::PipelineConfig;
use prism_processor::metadata_store::MetadataStore;
use prism_processor::model::{ImageFormat, ImageRecord, ImageStatus, StageName, StageRecord, StageStatus};
use prism_processor::{IngestDecision, Ingestor, ObjectCreated};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

fn ingestor(harness: &Harness) -> Ingestor {
    Ingestor::new(
        harness.orchestrator.clone(),
        harness.records.clone(),
        &PipelineConfig::default(),
    )
}

fn trigger(image_key: &str) -> ObjectCreated {
    ObjectCreated {
        image_key: image_key.to_string(),
        bucket: UPLOADS.to_string(),
        size: 1024,
        content_type: "image/jpeg".to_string(),
    }
}

#[tokio::test]
async fn direct_message_runs_to_completion() {
    let harness = Harness::new();
    harness.upload("uploads/abc.jpg", jpeg(64, 48));
    let ingestor = ingestor(&harness);

    let message = IncomingMessage::from_payload(
        "prism.uploads",
        br#"{"imageKey":"uploads/abc.jpg","bucket":"prism-uploads","size":2048}"#.to_vec(),
    );
    assert_ok!(ingestor.handle(&message).await);
    ingestor.wait_idle().await;

    let record = harness.records.record("uploads/abc.jpg").unwrap();
    assert_eq!(record.status, ImageStatus::Completed);
    assert_eq!(record.size, 2048);
    assert_eq!(record.content_type, "image/jpeg");
    assert_eq!(harness.records.lease_owner("uploads/abc.jpg"), None);
}

#[tokio::test]
async fn envelope_message_is_accepted() {
    let harness = Harness::new();
    harness.upload("uploads/abc.jpg", jpeg(64, 48));
    let ingestor = ingestor(&harness);

    let message = IncomingMessage::from_payload(
        "prism.uploads",
        br#"{"detail":{"bucket":{"name":"prism-uploads"},"object":{"key":"uploads/abc.jpg","size":10}}}"#
            .to_vec(),
    );
    assert_ok!(ingestor.handle(&message).await);
    ingestor.wait_idle().await;

    let record = harness.records.record("uploads/abc.jpg").unwrap();
    assert_eq!(record.status, ImageStatus::Completed);
    assert_eq!(record.bucket, UPLOADS);
}

#[tokio::test]
async fn malformed_message_is_a_deserialization_error() {
    let harness = Harness::new();
    let ingestor = ingestor(&harness);

    let message = IncomingMessage::from_payload("prism.uploads", br#"{"key":"uploads/abc.jpg"}"#.to_vec());
    let err = ingestor.handle(&message).await.unwrap_err();

    assert!(matches!(err, ConsumerError::DeserializationError(_)));
    assert!(harness.records.record("uploads/abc.jpg").is_none());
}

#[tokio::test]
async fn new_record_is_seeded_processing() {
    let harness = Harness::new();
    let ingestor = ingestor(&harness);

    // No object uploaded: the run fails, but seeding happens first
    let decision = assert_ok!(ingestor.ingest(trigger("uploads/ghost.jpg")).await);
    assert_eq!(decision, IngestDecision::Started);

    let seeded = harness.records.record("uploads/ghost.jpg").unwrap();
    assert_eq!(seeded.size, 1024);
    assert_eq!(seeded.bucket, UPLOADS);

    ingestor.wait_idle().await;
    let record = harness.records.record("uploads/ghost.jpg").unwrap();
    assert_eq!(record.status, ImageStatus::Failed);
    assert_eq!(record.stages[&StageName::Validation].status, StageStatus::Failed);
}

#[tokio::test]
async fn live_lease_drops_duplicate() {
    let harness = Harness::new();
    harness.upload("uploads/abc.jpg", jpeg(64, 48));
    let ingestor = ingestor(&harness);

    harness
        .records
        .insert(ImageRecord::processing("uploads/abc.jpg", UPLOADS, "image/jpeg", 1024));
    let other_run = Uuid::new_v4();
    assert!(assert_ok!(
        harness
            .records
            .acquire_lease("uploads/abc.jpg", other_run, Duration::from_secs(60))
            .await
    ));

    let decision = assert_ok!(ingestor.ingest(trigger("uploads/abc.jpg")).await);
    ingestor.wait_idle().await;

    assert_eq!(decision, IngestDecision::Duplicate);
    let record = harness.records.record("uploads/abc.jpg").unwrap();
    assert_eq!(record.status, ImageStatus::Processing);
    assert!(record.stages.is_empty());
    assert_eq!(harness.records.lease_owner("uploads/abc.jpg"), Some(other_run));
}

#[tokio::test]
async fn duplicate_notification_keeps_progress() {
    let harness = Harness::new();
    harness.upload("uploads/abc.jpg", jpeg(64, 48));
    let ingestor = ingestor(&harness);

    let mut record = ImageRecord::processing("uploads/abc.jpg", UPLOADS, "image/jpeg", 1024);
    record.stages.insert(
        StageName::Validation,
        StageRecord::completed(1).with_format(ImageFormat::Jpeg),
    );
    harness.records.insert(record);

    assert_eq!(
        assert_ok!(ingestor.ingest(trigger("uploads/abc.jpg")).await),
        IngestDecision::Started
    );
    ingestor.wait_idle().await;

    let record = harness.records.record("uploads/abc.jpg").unwrap();
    assert_eq!(record.status, ImageStatus::Completed);
    assert!(harness
        .records
        .stage_writes()
        .iter()
        .all(|(_, stage, _)| *stage != StageName::Validation));
}

#[tokio::test]
async fn finished_image_is_not_rerun() {
    let harness = Harness::new();
    let ingestor = ingestor(&harness);

    let mut record = ImageRecord::processing("uploads/abc.jpg", UPLOADS, "image/jpeg", 1024);
    record.status = ImageStatus::Rejected;
    harness.records.insert(record);

    let decision = assert_ok!(ingestor.ingest(trigger("uploads/abc.jpg")).await);
    ingestor.wait_idle().await;

    assert_eq!(decision, IngestDecision::AlreadyFinished(ImageStatus::Rejected));
    assert!(harness.records.stage_writes().is_empty());
    assert!(harness.notifier.sent().is_empty());
}

#[tokio::test]
async fn stalled_runs_are_resumed() {
    let harness = Harness::new();
    harness.upload("uploads/stuck.jpg", jpeg(64, 48));
    harness.upload("uploads/fresh.jpg", jpeg(64, 48));
    let ingestor = Arc::new(ingestor(&harness));

    let mut stuck = ImageRecord::processing("uploads/stuck.jpg", UPLOADS, "image/jpeg", 1024);
    stuck.updated_at = Utc::now() - ChronoDuration::hours(1);
    stuck
        .stages
        .insert(StageName::Validation, StageRecord::in_progress(1));
    harness.records.insert(stuck);
    harness
        .records
        .insert(ImageRecord::processing("uploads/fresh.jpg", UPLOADS, "image/jpeg", 1024));

    let restarted = assert_ok!(ingestor.recover_stalled(Duration::from_secs(600), 10).await);
    ingestor.wait_idle().await;

    assert_eq!(restarted, 1);
    assert_eq!(
        harness.records.record("uploads/stuck.jpg").unwrap().status,
        ImageStatus::Completed
    );
    assert_eq!(
        harness.records.record("uploads/fresh.jpg").unwrap().status,
        ImageStatus::Processing
    );
}

#[tokio::test]
async fn leased_stalled_record_is_left_alone() {
    let harness = Harness::new();
    let ingestor = ingestor(&harness);

    let mut stuck = ImageRecord::processing("uploads/stuck.jpg", UPLOADS, "image/jpeg", 1024);
    stuck.updated_at = Utc::now() - ChronoDuration::hours(1);
    harness.records.insert(stuck);
    assert_ok!(
        harness
            .records
            .acquire_lease("uploads/stuck.jpg", Uuid::new_v4(), Duration::from_secs(60))
            .await
    );

    let restarted = assert_ok!(ingestor.recover_stalled(Duration::from_secs(600), 10).await);

    assert_eq!(restarted, 0);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_runs() {
    let harness = Harness::new();
    harness.upload("uploads/abc.jpg", jpeg(256, 192));
    let ingestor = ingestor(&harness);

    assert_ok!(ingestor.ingest(trigger("uploads/abc.jpg")).await);
    ingestor.shutdown().await;

    assert_eq!(
        harness.records.record("uploads/abc.jpg").unwrap().status,
        ImageStatus::Completed
    );
    assert!(matches!(
        ingestor.ingest(trigger("uploads/other.jpg")).await,
        Err(prism_processor::ingestion::IngestError::ShuttingDown)
    ));
}
