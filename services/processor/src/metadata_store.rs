//! Durable per-image state in PostgreSQL.
//!
//! Each image is one row in `image_records`; stage entries live in a JSONB
//! object keyed by stage name and are written with `jsonb_set`, so a stage
//! update touches only its own key. Run leases are two extra columns that
//! never leave this module.

use crate::config::DatabaseConfig;
use crate::error::MetadataError;
use crate::model::{ImageRecord, ImageStatus, StageName, StageRecord};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Overall status transition plus its optional companions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ImageStatus,
    pub archived_location: Option<String>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn completed(archived_location: impl Into<String>) -> Self {
        Self {
            status: ImageStatus::Completed,
            archived_location: Some(archived_location.into()),
            error_message: None,
        }
    }

    pub fn failed(status: ImageStatus, error_message: impl Into<String>) -> Self {
        Self {
            status,
            archived_location: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Filters for listing records, newest upload first
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub status: Option<ImageStatus>,
    /// Upload time lower bound (inclusive)
    pub start: Option<DateTime<Utc>>,
    /// Upload time upper bound (inclusive)
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            status: None,
            start: None,
            end: None,
            limit: 100,
        }
    }
}

impl RecordQuery {
    pub fn matches(&self, record: &ImageRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.start.map_or(true, |t| record.upload_timestamp >= t)
            && self.end.map_or(true, |t| record.upload_timestamp <= t)
    }
}

/// Per-image processing state, keyed by image key
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert the record unless one already exists for the key.
    /// Returns true when a new record was written.
    async fn create(&self, record: &ImageRecord) -> Result<bool, MetadataError>;

    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>, MetadataError>;

    /// Write one stage entry. A stage that is already `COMPLETED` is left
    /// untouched and `false` is returned.
    async fn put_stage(
        &self,
        image_key: &str,
        stage: StageName,
        record: &StageRecord,
    ) -> Result<bool, MetadataError>;

    /// Move the overall status. Terminal records are never changed and
    /// `errorMessage` keeps the first cause written.
    async fn put_status(&self, image_key: &str, update: &StatusUpdate) -> Result<bool, MetadataError>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<ImageRecord>, MetadataError>;

    /// Take the per-image run lease if it is free or expired
    async fn acquire_lease(
        &self,
        image_key: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, MetadataError>;

    async fn release_lease(&self, image_key: &str, owner: Uuid) -> Result<(), MetadataError>;

    /// `PROCESSING` records untouched since `older_than` with no live lease
    async fn find_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>, MetadataError>;

    async fn ping(&self) -> Result<(), MetadataError>;
}

#[derive(Debug, FromRow)]
struct ImageRecordRow {
    image_key: String,
    bucket: String,
    upload_timestamp: DateTime<Utc>,
    status: String,
    content_type: String,
    size_bytes: i64,
    stages: Json<BTreeMap<StageName, StageRecord>>,
    archived_location: Option<String>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ImageRecordRow> for ImageRecord {
    type Error = MetadataError;

    fn try_from(row: ImageRecordRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ImageStatus>()
            .map_err(|e| MetadataError::Serialization(e.to_string()))?;

        Ok(ImageRecord {
            image_key: row.image_key,
            bucket: row.bucket,
            upload_timestamp: row.upload_timestamp,
            status,
            content_type: row.content_type,
            size: row.size_bytes.max(0) as u64,
            stages: row.stages.0,
            archived_location: row.archived_location,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_RECORD: &str = r#"
    SELECT image_key, bucket, upload_timestamp, status, content_type, size_bytes,
           stages, archived_location, error_message, updated_at
    FROM image_records
"#;

/// PostgreSQL-backed [`MetadataStore`]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn exists(&self, image_key: &str) -> Result<bool, MetadataError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT image_key FROM image_records WHERE image_key = $1")
                .bind(image_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    #[instrument(skip(self, record), fields(image_key = %record.image_key))]
    async fn create(&self, record: &ImageRecord) -> Result<bool, MetadataError> {
        let result = sqlx::query(
            r#"
            INSERT INTO image_records (
                image_key, bucket, upload_timestamp, status, content_type,
                size_bytes, stages, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (image_key) DO NOTHING
            "#,
        )
        .bind(&record.image_key)
        .bind(&record.bucket)
        .bind(record.upload_timestamp)
        .bind(record.status.as_str())
        .bind(&record.content_type)
        .bind(record.size as i64)
        .bind(Json(&record.stages))
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(inserted, "Image record seeded");
        Ok(inserted)
    }

    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>, MetadataError> {
        let row: Option<ImageRecordRow> =
            sqlx::query_as(&format!("{SELECT_RECORD} WHERE image_key = $1"))
                .bind(image_key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(ImageRecord::try_from).transpose()
    }

    #[instrument(skip(self, record), fields(status = ?record.status))]
    async fn put_stage(
        &self,
        image_key: &str,
        stage: StageName,
        record: &StageRecord,
    ) -> Result<bool, MetadataError> {
        let payload = serde_json::to_value(record)?;

        let result = sqlx::query(
            r#"
            UPDATE image_records
            SET stages = jsonb_set(stages, ARRAY[$2::text], $3, true),
                updated_at = NOW()
            WHERE image_key = $1
              AND COALESCE(stages -> $2::text ->> 'status', '') <> 'COMPLETED'
            "#,
        )
        .bind(image_key)
        .bind(stage.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        if self.exists(image_key).await? {
            debug!("Stage already completed, write skipped");
            Ok(false)
        } else {
            Err(MetadataError::NotFound(image_key.to_string()))
        }
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn put_status(&self, image_key: &str, update: &StatusUpdate) -> Result<bool, MetadataError> {
        let result = sqlx::query(
            r#"
            UPDATE image_records
            SET status = $2,
                archived_location = COALESCE($3, archived_location),
                error_message = COALESCE(error_message, $4),
                updated_at = NOW()
            WHERE image_key = $1
              AND status NOT IN ('COMPLETED', 'FAILED', 'REJECTED')
            "#,
        )
        .bind(image_key)
        .bind(update.status.as_str())
        .bind(&update.archived_location)
        .bind(&update.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        if self.exists(image_key).await? {
            Ok(false)
        } else {
            Err(MetadataError::NotFound(image_key.to_string()))
        }
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<ImageRecord>, MetadataError> {
        let rows: Vec<ImageRecordRow> = sqlx::query_as(&format!(
            r#"{SELECT_RECORD}
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::timestamptz IS NULL OR upload_timestamp >= $2)
              AND ($3::timestamptz IS NULL OR upload_timestamp <= $3)
            ORDER BY upload_timestamp DESC
            LIMIT $4
            "#
        ))
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.start)
        .bind(query.end)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn acquire_lease(
        &self,
        image_key: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, MetadataError> {
        let result = sqlx::query(
            r#"
            UPDATE image_records
            SET lease_owner = $2,
                lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE image_key = $1
              AND (lease_owner IS NULL OR lease_expires_at < NOW() OR lease_owner = $2)
            "#,
        )
        .bind(image_key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, image_key: &str, owner: Uuid) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            UPDATE image_records
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE image_key = $1 AND lease_owner = $2
            "#,
        )
        .bind(image_key)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>, MetadataError> {
        let rows: Vec<ImageRecordRow> = sqlx::query_as(&format!(
            r#"{SELECT_RECORD}
            WHERE status = 'PROCESSING'
              AND updated_at < $1
              AND (lease_owner IS NULL OR lease_expires_at < NOW())
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_query_matching() {
        let mut record = ImageRecord::processing("uploads/a.jpg", "uploads", "image/jpeg", 10);
        record.upload_timestamp = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();

        assert!(RecordQuery::default().matches(&record));

        let by_status = RecordQuery {
            status: Some(ImageStatus::Completed),
            ..Default::default()
        };
        assert!(!by_status.matches(&record));

        let window = RecordQuery {
            start: Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(window.matches(&record));

        let ends_at_upload = RecordQuery {
            end: Some(record.upload_timestamp),
            ..Default::default()
        };
        assert!(ends_at_upload.matches(&record));

        let ends_before = RecordQuery {
            end: Some(Utc.with_ymd_and_hms(2024, 3, 10, 11, 59, 59).unwrap()),
            ..Default::default()
        };
        assert!(!ends_before.matches(&record));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = ImageRecordRow {
            image_key: "uploads/a.jpg".to_string(),
            bucket: "uploads".to_string(),
            upload_timestamp: Utc::now(),
            status: "ARCHIVING".to_string(),
            content_type: "image/jpeg".to_string(),
            size_bytes: 10,
            stages: Json(BTreeMap::new()),
            archived_location: None,
            error_message: None,
            updated_at: Utc::now(),
        };

        assert!(matches!(
            ImageRecord::try_from(row),
            Err(MetadataError::Serialization(_))
        ));
    }
}
