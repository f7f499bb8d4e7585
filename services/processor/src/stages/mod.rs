//! Stage handlers.
//!
//! A handler does its I/O and returns its result; it never writes stage
//! status. The orchestrator records `IN_PROGRESS`/`COMPLETED`/`FAILED`
//! around each attempt using [`StageOutput::stage_record`].

mod archive;
mod metadata;
mod resize;
mod thumbnail;
mod validate;

pub use archive::{ArchiveLocation, ArchiveStage, Renditions};
pub use metadata::MetadataStage;
pub use resize::ResizeStage;
pub use thumbnail::ThumbnailStage;
pub use validate::{sniff_format, ValidateStage, SNIFF_LEN};

use crate::model::{ImageFormat, ImageMetadata, StageRecord};
use chrono::NaiveDate;

/// The image a run is working on; constant across stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub image_key: String,
    pub bucket: String,
}

impl ImageRef {
    pub fn new(image_key: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            image_key: image_key.into(),
            bucket: bucket.into(),
        }
    }
}

/// Stage result that can be written as a `COMPLETED` stage entry
pub trait StageOutput {
    fn stage_record(&self, attempts: u32) -> StageRecord;
}

impl StageOutput for ImageFormat {
    fn stage_record(&self, attempts: u32) -> StageRecord {
        StageRecord::completed(attempts).with_format(*self)
    }
}

impl StageOutput for ImageMetadata {
    fn stage_record(&self, attempts: u32) -> StageRecord {
        StageRecord::completed(attempts).with_metadata(self)
    }
}

/// Key of an object a stage wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey(pub String);

impl StageOutput for DerivedKey {
    fn stage_record(&self, attempts: u32) -> StageRecord {
        StageRecord::completed(attempts).with_output_key(self.0.clone())
    }
}

/// Final path segment of a key
pub fn file_name(image_key: &str) -> &str {
    image_key.rsplit('/').next().unwrap_or(image_key)
}

/// File name without its last extension. Dot-files keep their name.
pub fn base_name(image_key: &str) -> &str {
    let name = file_name(image_key);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

pub fn resized_key(image_key: &str) -> String {
    format!("processed/{}/resized.jpg", file_name(image_key))
}

pub fn thumbnail_key(image_key: &str) -> String {
    format!("processed/{}/thumbnail.jpg", file_name(image_key))
}

/// `archive/YYYY/MM/DD/<baseName>/`
pub fn archive_prefix(date: NaiveDate, image_key: &str) -> String {
    format!("archive/{}/{}/", date.format("%Y/%m/%d"), base_name(image_key))
}
