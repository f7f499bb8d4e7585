use super::{thumbnail_key, DerivedKey, ImageRef};
use crate::codec::ImageCodec;
use crate::error::StageError;
use crate::model::ImageMetadata;
use crate::object_store::ObjectStore;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Fixed-size center-cropped JPEG rendition
pub struct ThumbnailStage {
    objects: Arc<dyn ObjectStore>,
    codec: Arc<dyn ImageCodec>,
    width: u32,
    height: u32,
}

impl ThumbnailStage {
    pub fn new(objects: Arc<dyn ObjectStore>, codec: Arc<dyn ImageCodec>, width: u32, height: u32) -> Self {
        Self {
            objects,
            codec,
            width,
            height,
        }
    }

    #[instrument(skip(self, metadata), fields(image_key = %image.image_key))]
    pub async fn run(&self, image: &ImageRef, metadata: &ImageMetadata) -> Result<DerivedKey, StageError> {
        let body = self.objects.get(&image.bucket, &image.image_key, None).await?;

        let codec = self.codec.clone();
        let (width, height) = (self.width, self.height);
        let rendition = tokio::task::spawn_blocking(move || codec.cover(&body, width, height)).await??;

        let key = thumbnail_key(&image.image_key);
        self.objects
            .put(&image.bucket, &key, rendition.bytes, "image/jpeg")
            .await?;

        debug!(
            source_width = metadata.width,
            source_height = metadata.height,
            output_key = %key,
            "Thumbnail written"
        );
        Ok(DerivedKey(key))
    }
}
