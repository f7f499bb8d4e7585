use super::{resized_key, DerivedKey, ImageRef};
use crate::codec::ImageCodec;
use crate::error::StageError;
use crate::model::ImageMetadata;
use crate::object_store::ObjectStore;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Bounded-dimension JPEG rendition, written next to the original
pub struct ResizeStage {
    objects: Arc<dyn ObjectStore>,
    codec: Arc<dyn ImageCodec>,
    max_width: u32,
    max_height: u32,
}

impl ResizeStage {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        codec: Arc<dyn ImageCodec>,
        max_width: u32,
        max_height: u32,
    ) -> Self {
        Self {
            objects,
            codec,
            max_width,
            max_height,
        }
    }

    #[instrument(skip(self, metadata), fields(image_key = %image.image_key))]
    pub async fn run(&self, image: &ImageRef, metadata: &ImageMetadata) -> Result<DerivedKey, StageError> {
        let body = self.objects.get(&image.bucket, &image.image_key, None).await?;

        let codec = self.codec.clone();
        let (max_width, max_height) = (self.max_width, self.max_height);
        let rendition =
            tokio::task::spawn_blocking(move || codec.fit_within(&body, max_width, max_height)).await??;

        let key = resized_key(&image.image_key);
        self.objects
            .put(&image.bucket, &key, rendition.bytes, "image/jpeg")
            .await?;

        debug!(
            from = ?(metadata.width, metadata.height),
            to = ?(rendition.width, rendition.height),
            output_key = %key,
            "Resized rendition written"
        );
        Ok(DerivedKey(key))
    }
}
