//! In-memory collaborators for local runs and tests.
//!
//! [`InMemoryObjectStore`] can be told to fail specific operations a fixed
//! number of times, which is how retry behaviour is exercised without a
//! real object store.

use crate::error::{MetadataError, ObjectStoreError};
use crate::metadata_store::{MetadataStore, RecordQuery, StatusUpdate};
use crate::model::{ImageRecord, StageName, StageRecord};
use crate::notifier::{Notification, NotificationSink, NotifyError};
use crate::object_store::{ByteRange, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Operations a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Put,
    Copy,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    key_contains: String,
    remaining: usize,
    error: ObjectStoreError,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    content_type: String,
}

/// One recorded `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub bucket: String,
    pub key: String,
    pub range: Option<ByteRange>,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    faults: Mutex<Vec<Fault>>,
    reads: Mutex<Vec<ReadRecord>>,
    copies: Mutex<Vec<(String, String)>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>, content_type: &str) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.content_type.clone())
    }

    /// Sorted keys held in `bucket`
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Fail the next `times` calls of `op` whose key contains `key_contains`
    pub fn fail_next(&self, op: StoreOp, key_contains: &str, times: usize, error: ObjectStoreError) {
        self.faults.lock().push(Fault {
            op,
            key_contains: key_contains.to_string(),
            remaining: times,
            error,
        });
    }

    pub fn reads(&self) -> Vec<ReadRecord> {
        self.reads.lock().clone()
    }

    /// Destination `(bucket, key)` of every successful copy
    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().clone()
    }

    fn injected(&self, op: StoreOp, key: &str) -> Result<(), ObjectStoreError> {
        let mut faults = self.faults.lock();
        for fault in faults.iter_mut() {
            if fault.op == op && fault.remaining > 0 && key.contains(&fault.key_contains) {
                fault.remaining -= 1;
                return Err(fault.error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, ObjectStoreError> {
        self.injected(StoreOp::Get, key)?;

        self.reads.lock().push(ReadRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            range,
        });

        let body = self.object(bucket, key).ok_or_else(|| ObjectStoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

        Ok(match range {
            Some(r) => {
                let len = body.len() as u64;
                let start = r.start.min(len) as usize;
                let end = r.end.saturating_add(1).min(len) as usize;
                body.slice(start..end.max(start))
            }
            None => body,
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.injected(StoreOp::Put, key)?;
        self.insert(bucket, key, body, content_type);
        Ok(())
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), ObjectStoreError> {
        self.injected(StoreOp::Copy, dst_key)?;

        let source = self
            .objects
            .read()
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: src_bucket.to_string(),
                key: src_key.to_string(),
            })?;

        self.objects
            .write()
            .insert((dst_bucket.to_string(), dst_key.to_string()), source);
        self.copies
            .lock()
            .push((dst_bucket.to_string(), dst_key.to_string()));
        Ok(())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        Ok(format!(
            "memory://{bucket}/{key}?expires={}",
            expires_in.as_secs()
        ))
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, ImageRecord>>,
    leases: Mutex<HashMap<String, Lease>>,
    stage_writes: Mutex<Vec<(String, StageName, StageRecord)>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace or insert a record as-is
    pub fn insert(&self, record: ImageRecord) {
        self.records.write().insert(record.image_key.clone(), record);
    }

    pub fn record(&self, image_key: &str) -> Option<ImageRecord> {
        self.records.read().get(image_key).cloned()
    }

    /// Every stage write that was applied, in order
    pub fn stage_writes(&self) -> Vec<(String, StageName, StageRecord)> {
        self.stage_writes.lock().clone()
    }

    pub fn lease_owner(&self, image_key: &str) -> Option<Uuid> {
        self.leases
            .lock()
            .get(image_key)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, record: &ImageRecord) -> Result<bool, MetadataError> {
        let mut records = self.records.write();
        if records.contains_key(&record.image_key) {
            return Ok(false);
        }
        records.insert(record.image_key.clone(), record.clone());
        Ok(true)
    }

    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>, MetadataError> {
        Ok(self.record(image_key))
    }

    async fn put_stage(
        &self,
        image_key: &str,
        stage: StageName,
        record: &StageRecord,
    ) -> Result<bool, MetadataError> {
        let mut records = self.records.write();
        let existing = records
            .get_mut(image_key)
            .ok_or_else(|| MetadataError::NotFound(image_key.to_string()))?;

        if existing
            .stages
            .get(&stage)
            .is_some_and(|s| s.is_completed())
        {
            return Ok(false);
        }

        existing.stages.insert(stage, record.clone());
        existing.updated_at = Utc::now();
        self.stage_writes
            .lock()
            .push((image_key.to_string(), stage, record.clone()));
        Ok(true)
    }

    async fn put_status(&self, image_key: &str, update: &StatusUpdate) -> Result<bool, MetadataError> {
        let mut records = self.records.write();
        let existing = records
            .get_mut(image_key)
            .ok_or_else(|| MetadataError::NotFound(image_key.to_string()))?;

        if existing.status.is_terminal() {
            return Ok(false);
        }

        existing.status = update.status;
        if update.archived_location.is_some() {
            existing.archived_location = update.archived_location.clone();
        }
        if existing.error_message.is_none() {
            existing.error_message = update.error_message.clone();
        }
        existing.updated_at = Utc::now();
        Ok(true)
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<ImageRecord>, MetadataError> {
        let mut matched: Vec<ImageRecord> = self
            .records
            .read()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.upload_timestamp.cmp(&a.upload_timestamp));
        matched.truncate(query.limit.max(0) as usize);
        Ok(matched)
    }

    async fn acquire_lease(
        &self,
        image_key: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<bool, MetadataError> {
        if !self.records.read().contains_key(image_key) {
            return Ok(false);
        }

        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get(image_key) {
            Some(lease) if lease.owner != owner && lease.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    image_key.to_string(),
                    Lease {
                        owner,
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, image_key: &str, owner: Uuid) -> Result<(), MetadataError> {
        let mut leases = self.leases.lock();
        if leases.get(image_key).is_some_and(|l| l.owner == owner) {
            leases.remove(image_key);
        }
        Ok(())
    }

    async fn find_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ImageRecord>, MetadataError> {
        let leased: Vec<String> = {
            let now = Instant::now();
            self.leases
                .lock()
                .iter()
                .filter(|(_, l)| l.expires_at > now)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut stalled: Vec<ImageRecord> = self
            .records
            .read()
            .values()
            .filter(|r| {
                r.status == crate::model::ImageStatus::Processing
                    && r.updated_at < older_than
                    && !leased.contains(&r.image_key)
            })
            .cloned()
            .collect();

        stalled.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stalled.truncate(limit.max(0) as usize);
        Ok(stalled)
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Keeps every notification it is given
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageStatus, StageStatus};

    #[tokio::test]
    async fn test_ranged_get_returns_prefix() {
        let store = InMemoryObjectStore::new();
        store.insert("uploads", "a.jpg", Bytes::from_static(b"0123456789abcdefgh"), "image/jpeg");

        let prefix = store
            .get("uploads", "a.jpg", Some(ByteRange::prefix(12)))
            .await
            .unwrap();
        assert_eq!(&prefix[..], b"0123456789ab");

        let short = InMemoryObjectStore::new();
        short.insert("uploads", "b.jpg", Bytes::from_static(b"abc"), "image/jpeg");
        let all = short
            .get("uploads", "b.jpg", Some(ByteRange::prefix(12)))
            .await
            .unwrap();
        assert_eq!(&all[..], b"abc");
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = InMemoryObjectStore::new();
        store.fail_next(
            StoreOp::Put,
            "thumbnail",
            1,
            ObjectStoreError::Unavailable("503".into()),
        );

        let first = store
            .put("b", "processed/a.jpg/thumbnail.jpg", Bytes::new(), "image/jpeg")
            .await;
        assert!(matches!(first, Err(ObjectStoreError::Unavailable(_))));

        store
            .put("b", "processed/a.jpg/thumbnail.jpg", Bytes::new(), "image/jpeg")
            .await
            .unwrap();
        store
            .put("b", "processed/a.jpg/resized.jpg", Bytes::new(), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(store.keys("b").len(), 2);
    }

    #[tokio::test]
    async fn test_completed_stage_is_not_overwritten() {
        let store = InMemoryMetadataStore::new();
        let record = ImageRecord::processing("uploads/a.jpg", "uploads", "image/jpeg", 1);
        assert!(store.create(&record).await.unwrap());
        assert!(!store.create(&record).await.unwrap());

        assert!(store
            .put_stage("uploads/a.jpg", StageName::Validation, &StageRecord::completed(1))
            .await
            .unwrap());
        assert!(!store
            .put_stage("uploads/a.jpg", StageName::Validation, &StageRecord::failed(1, "late"))
            .await
            .unwrap());

        let stored = store.record("uploads/a.jpg").unwrap();
        assert_eq!(stored.stages[&StageName::Validation].status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = InMemoryMetadataStore::new();
        store
            .create(&ImageRecord::processing("k", "uploads", "image/jpeg", 1))
            .await
            .unwrap();

        let failed = StatusUpdate::failed(ImageStatus::Failed, "first");
        assert!(store.put_status("k", &failed).await.unwrap());
        assert!(!store
            .put_status("k", &StatusUpdate::completed("archive/x/"))
            .await
            .unwrap());

        let stored = store.record("k").unwrap();
        assert_eq!(stored.status, ImageStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("first"));
        assert!(stored.archived_location.is_none());
    }

    #[tokio::test]
    async fn test_lease_excludes_second_owner() {
        let store = InMemoryMetadataStore::new();
        store
            .create(&ImageRecord::processing("k", "uploads", "image/jpeg", 1))
            .await
            .unwrap();

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(store.acquire_lease("k", a, Duration::from_secs(60)).await.unwrap());
        assert!(!store.acquire_lease("k", b, Duration::from_secs(60)).await.unwrap());

        store.release_lease("k", a).await.unwrap();
        assert!(store.acquire_lease("k", b, Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.lease_owner("k"), Some(b));
    }
}
