#![allow(dead_code)]

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use prism_processor::config::PipelineConfig;
use prism_processor::memory::{InMemoryMetadataStore, InMemoryObjectStore, RecordingNotifier};
use prism_processor::{Orchestrator, PipelineDeps, RasterCodec, RetryPolicy, RunRequest};
use std::sync::Arc;
use std::time::Duration;

pub const UPLOADS: &str = "prism-uploads";
pub const ARCHIVE: &str = "prism-archive";

/// Gradient JPEG of the given size
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 90)
        .encode_image(&img)
        .expect("encode test jpeg");
    buf
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        multiplier: 2.0,
    }
}

pub fn request(image_key: &str) -> RunRequest {
    RunRequest {
        image_key: image_key.to_string(),
        bucket: UPLOADS.to_string(),
        upload_timestamp: chrono::Utc::now(),
        content_type: "image/jpeg".to_string(),
        size: 0,
    }
}

/// Pipeline wired to in-memory collaborators
pub struct Harness {
    pub objects: Arc<InMemoryObjectStore>,
    pub records: Arc<InMemoryMetadataStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let objects = Arc::new(InMemoryObjectStore::new());
        let records = Arc::new(InMemoryMetadataStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let orchestrator = Orchestrator::new(
            PipelineDeps {
                objects: objects.clone(),
                records: records.clone(),
                codec: Arc::new(RasterCodec::default()),
                notifier: notifier.clone(),
            },
            &PipelineConfig::default(),
            ARCHIVE,
        )
        .with_retry_policy(fast_retry());

        Self {
            objects,
            records,
            notifier,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn upload(&self, image_key: &str, body: Vec<u8>) {
        self.objects.insert(UPLOADS, image_key, body, "image/jpeg");
    }
}
