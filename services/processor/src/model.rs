//! Durable per-image processing state.
//!
//! An [`ImageRecord`] is keyed by the image's storage key and carries one
//! [`StageRecord`] per attempted stage. Both serialize with camelCase field
//! names; this is the shape returned by the status API and stored in the
//! `stages` JSONB column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Pipeline stages, in DAG order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Validation,
    Metadata,
    Resize,
    Thumbnail,
    Archive,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Validation,
        StageName::Metadata,
        StageName::Resize,
        StageName::Thumbnail,
        StageName::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Validation => "validation",
            StageName::Metadata => "metadata",
            StageName::Resize => "resize",
            StageName::Thumbnail => "thumbnail",
            StageName::Archive => "archive",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
    Rejected,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Uploaded => "UPLOADED",
            ImageStatus::Processing => "PROCESSING",
            ImageStatus::Completed => "COMPLETED",
            ImageStatus::Failed => "FAILED",
            ImageStatus::Rejected => "REJECTED",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImageStatus::Completed | ImageStatus::Failed | ImageStatus::Rejected
        )
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown image status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for ImageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UPLOADED" => Ok(ImageStatus::Uploaded),
            "PROCESSING" => Ok(ImageStatus::Processing),
            "COMPLETED" => Ok(ImageStatus::Completed),
            "FAILED" => Ok(ImageStatus::Failed),
            "REJECTED" => Ok(ImageStatus::Rejected),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    InProgress,
    Completed,
    Failed,
}

/// Image formats recognised by their magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural properties decoded from the full image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    /// "srgb" for colour images, "b-w" for greyscale
    pub color_space: String,
    pub channels: u8,
    pub has_alpha: bool,
}

/// Per-stage status entry
///
/// Stage-specific payload fields are flat and optional: `format` for
/// validation, the decoded dimensions for metadata, `outputKey` for the
/// renditions and `errorMessage` for any failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub status: StageStatus,
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt that produced this entry
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_alpha: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

impl StageRecord {
    fn with_status(status: StageStatus, attempts: u32) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            attempts,
            error_message: None,
            format: None,
            width: None,
            height: None,
            color_space: None,
            channels: None,
            has_alpha: None,
            output_key: None,
        }
    }

    pub fn in_progress(attempts: u32) -> Self {
        Self::with_status(StageStatus::InProgress, attempts)
    }

    pub fn completed(attempts: u32) -> Self {
        Self::with_status(StageStatus::Completed, attempts)
    }

    pub fn failed(attempts: u32, error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..Self::with_status(StageStatus::Failed, attempts)
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_metadata(mut self, metadata: &ImageMetadata) -> Self {
        self.format = Some(metadata.format);
        self.width = Some(metadata.width);
        self.height = Some(metadata.height);
        self.color_space = Some(metadata.color_space.clone());
        self.channels = Some(metadata.channels);
        self.has_alpha = Some(metadata.has_alpha);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }

    /// Rebuild the metadata payload written by the metadata stage
    pub fn metadata(&self) -> Option<ImageMetadata> {
        Some(ImageMetadata {
            width: self.width?,
            height: self.height?,
            format: self.format?,
            color_space: self.color_space.clone()?,
            channels: self.channels?,
            has_alpha: self.has_alpha?,
        })
    }
}

/// One record per ingested image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub image_key: String,
    /// Working storage location the image was uploaded to
    pub bucket: String,
    pub upload_timestamp: DateTime<Utc>,
    pub status: ImageStatus,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Fresh record for a newly announced upload: `PROCESSING`, no stages
    pub fn processing(
        image_key: impl Into<String>,
        bucket: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            image_key: image_key.into(),
            bucket: bucket.into(),
            upload_timestamp: now,
            status: ImageStatus::Processing,
            content_type: content_type.into(),
            size,
            stages: BTreeMap::new(),
            archived_location: None,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.get(&name)
    }

    /// The stage entry, only if it completed
    pub fn completed_stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stage(name).filter(|s| s.is_completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ImageStatus::Processing).unwrap(),
            "\"PROCESSING\""
        );
        assert_eq!(
            serde_json::to_string(&StageStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!("rejected".parse::<ImageStatus>(), Ok(ImageStatus::Rejected));
        assert!("DONE".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ImageStatus::Uploaded.is_terminal());
        assert!(!ImageStatus::Processing.is_terminal());
        assert!(ImageStatus::Completed.is_terminal());
        assert!(ImageStatus::Failed.is_terminal());
        assert!(ImageStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_record_serializes_stage_map_by_name() {
        let mut record = ImageRecord::processing("uploads/abc.jpg", "uploads", "image/jpeg", 42);
        record.stages.insert(
            StageName::Validation,
            StageRecord::completed(1).with_format(ImageFormat::Jpeg),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["imageKey"], "uploads/abc.jpg");
        assert_eq!(json["status"], "PROCESSING");
        assert_eq!(json["stages"]["validation"]["status"], "COMPLETED");
        assert_eq!(json["stages"]["validation"]["format"], "jpeg");
        assert!(json.get("archivedLocation").is_none());

        let back: ImageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_stage_metadata_payload() {
        let metadata = ImageMetadata {
            width: 2000,
            height: 1500,
            format: ImageFormat::Jpeg,
            color_space: "srgb".to_string(),
            channels: 3,
            has_alpha: false,
        };

        let stage = StageRecord::completed(2).with_metadata(&metadata);
        assert_eq!(stage.metadata(), Some(metadata));
        assert_eq!(stage.attempts, 2);

        assert_eq!(StageRecord::completed(1).metadata(), None);
    }

    #[test]
    fn test_failed_stage_carries_message() {
        let stage = StageRecord::failed(1, "Invalid image format");
        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["errorMessage"], "Invalid image format");
        assert!(!stage.is_completed());
    }
}
