use super::{archive_prefix, ImageRef, StageOutput};
use crate::error::StageError;
use crate::model::StageRecord;
use crate::object_store::ObjectStore;
use chrono::NaiveDate;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, instrument};

/// Derived keys available to archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Renditions {
    pub resized: Option<String>,
    pub thumbnail: Option<String>,
}

/// Archive prefix the objects were copied under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation(pub String);

impl StageOutput for ArchiveLocation {
    fn stage_record(&self, attempts: u32) -> StageRecord {
        StageRecord::completed(attempts).with_output_key(self.0.clone())
    }
}

/// Copies the original and its renditions into the archive bucket
pub struct ArchiveStage {
    objects: Arc<dyn ObjectStore>,
    archive_bucket: String,
}

impl ArchiveStage {
    pub fn new(objects: Arc<dyn ObjectStore>, archive_bucket: impl Into<String>) -> Self {
        Self {
            objects,
            archive_bucket: archive_bucket.into(),
        }
    }

    #[instrument(skip(self, renditions), fields(image_key = %image.image_key))]
    pub async fn run(
        &self,
        image: &ImageRef,
        renditions: &Renditions,
        date: NaiveDate,
    ) -> Result<ArchiveLocation, StageError> {
        let prefix = archive_prefix(date, &image.image_key);

        let mut copies = vec![(image.image_key.as_str(), format!("{prefix}original.jpg"))];
        if let Some(ref resized) = renditions.resized {
            copies.push((resized.as_str(), format!("{prefix}resized.jpg")));
        }
        if let Some(ref thumbnail) = renditions.thumbnail {
            copies.push((thumbnail.as_str(), format!("{prefix}thumbnail.jpg")));
        }

        try_join_all(copies.iter().map(|(src, dst)| {
            self.objects
                .copy(&image.bucket, src, &self.archive_bucket, dst)
        }))
        .await?;

        info!(archived_location = %prefix, objects = copies.len(), "Image archived");
        Ok(ArchiveLocation(prefix))
    }
}
