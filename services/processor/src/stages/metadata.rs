use super::ImageRef;
use crate::codec::ImageCodec;
use crate::error::StageError;
use crate::model::ImageMetadata;
use crate::object_store::ObjectStore;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Decodes the full object and records its structure
pub struct MetadataStage {
    objects: Arc<dyn ObjectStore>,
    codec: Arc<dyn ImageCodec>,
}

impl MetadataStage {
    pub fn new(objects: Arc<dyn ObjectStore>, codec: Arc<dyn ImageCodec>) -> Self {
        Self { objects, codec }
    }

    #[instrument(skip(self), fields(image_key = %image.image_key))]
    pub async fn run(&self, image: &ImageRef) -> Result<ImageMetadata, StageError> {
        let body = self.objects.get(&image.bucket, &image.image_key, None).await?;

        let codec = self.codec.clone();
        let metadata = tokio::task::spawn_blocking(move || codec.probe(&body)).await??;

        debug!(
            width = metadata.width,
            height = metadata.height,
            format = %metadata.format,
            "Image metadata extracted"
        );
        Ok(metadata)
    }
}
