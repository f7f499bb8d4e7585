use super::ImageRef;
use crate::error::StageError;
use crate::model::ImageFormat;
use crate::object_store::{ByteRange, ObjectStore};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Bytes read from the head of the object
pub const SNIFF_LEN: u64 = 12;

/// Classify a byte prefix by magic number
pub fn sniff_format(prefix: &[u8]) -> Option<ImageFormat> {
    match prefix {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        [0x89, b'P', b'N', b'G', ..] => Some(ImageFormat::Png),
        [b'G', b'I', b'F', ..] => Some(ImageFormat::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::Webp),
        _ => None,
    }
}

/// Format sniffer
pub struct ValidateStage {
    objects: Arc<dyn ObjectStore>,
}

impl ValidateStage {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    #[instrument(skip(self), fields(image_key = %image.image_key))]
    pub async fn run(&self, image: &ImageRef) -> Result<ImageFormat, StageError> {
        let prefix = self
            .objects
            .get(&image.bucket, &image.image_key, Some(ByteRange::prefix(SNIFF_LEN)))
            .await?;

        let format = sniff_format(&prefix).ok_or(StageError::InvalidImage)?;
        debug!(%format, "Image format recognised");
        Ok(format)
    }
}
