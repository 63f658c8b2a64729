use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use tether_types::{CoreError, CoreResult};

use crate::record::{IdempotencyRecord, IdempotencyStatus};

/// The exact atomic primitives a ledger driver must provide. Drivers
/// implement this independently; there is no shared base.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, namespace: &str, key_hash: &str)
        -> CoreResult<Option<IdempotencyRecord>>;

    /// Insert-if-not-exists. Returns false when a record already occupies
    /// (namespace, key_hash).
    async fn create_if_absent(&self, record: &IdempotencyRecord) -> CoreResult<bool>;

    /// Optimistic write: replaces the stored record only when its version
    /// equals `expected_version`. The caller supplies the already-bumped
    /// record.
    async fn update_if_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: u64,
    ) -> CoreResult<bool>;

    /// Take the lock when no live lock holds the record. Covers fresh
    /// failed/expired records and stale locks. Returns the updated record on
    /// success, None while another holder's lock is live.
    async fn acquire_lock_if_free(
        &self,
        namespace: &str,
        key_hash: &str,
        lock_id: &str,
        lock_expires_at: DateTime<Utc>,
    ) -> CoreResult<Option<IdempotencyRecord>>;

    async fn delete(&self, namespace: &str, key_hash: &str) -> CoreResult<bool>;

    /// Remove records whose `expires_at` is before the cutoff. Returns how
    /// many were removed.
    async fn cleanup_expired(&self, before: DateTime<Utc>) -> CoreResult<u64>;
}

fn take_lock(record: &mut IdempotencyRecord, lock_id: &str, lock_expires_at: DateTime<Utc>) {
    record.status = IdempotencyStatus::Locked;
    record.lock_id = Some(lock_id.to_string());
    record.lock_expires_at = Some(lock_expires_at);
    record.attempts += 1;
    record.version += 1;
    record.updated_at = Utc::now();
    record.error = None;
}

// ---------------------------------------------------------------------------
// In-memory driver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<(String, String), IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(
        &self,
        namespace: &str,
        key_hash: &str,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(namespace.to_string(), key_hash.to_string()))
            .cloned())
    }

    async fn create_if_absent(&self, record: &IdempotencyRecord) -> CoreResult<bool> {
        let mut records = self.records.lock().await;
        let scope = (record.namespace.clone(), record.key_hash.clone());
        if records.contains_key(&scope) {
            return Ok(false);
        }
        records.insert(scope, record.clone());
        Ok(true)
    }

    async fn update_if_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: u64,
    ) -> CoreResult<bool> {
        let mut records = self.records.lock().await;
        let scope = (record.namespace.clone(), record.key_hash.clone());
        match records.get(&scope) {
            Some(existing) if existing.version == expected_version => {
                records.insert(scope, record.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn acquire_lock_if_free(
        &self,
        namespace: &str,
        key_hash: &str,
        lock_id: &str,
        lock_expires_at: DateTime<Utc>,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        let mut records = self.records.lock().await;
        let scope = (namespace.to_string(), key_hash.to_string());
        let Some(record) = records.get_mut(&scope) else {
            return Ok(None);
        };
        if record.status == IdempotencyStatus::Completed || record.lock_is_live(Utc::now()) {
            return Ok(None);
        }
        take_lock(record, lock_id, lock_expires_at);
        Ok(Some(record.clone()))
    }

    async fn delete(&self, namespace: &str, key_hash: &str) -> CoreResult<bool> {
        let mut records = self.records.lock().await;
        Ok(records
            .remove(&(namespace.to_string(), key_hash.to_string()))
            .is_some())
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> CoreResult<u64> {
        let mut records = self.records.lock().await;
        let initial = records.len();
        records.retain(|_, record| record.expires_at >= before);
        Ok((initial - records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// File-backed driver
// ---------------------------------------------------------------------------

/// One JSON file per record under the base directory. A process-wide mutex
/// makes each trait call atomic; cross-process deployments want a driver
/// over a real database instead.
pub struct FileIdempotencyStore {
    base: PathBuf,
    guard: Mutex<()>,
}

impl FileIdempotencyStore {
    pub async fn open(base: impl AsRef<Path>) -> CoreResult<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(Self {
            base,
            guard: Mutex::new(()),
        })
    }

    fn record_path(&self, namespace: &str, key_hash: &str) -> PathBuf {
        self.base.join(format!("{namespace}__{key_hash}.json"))
    }

    async fn read_record(&self, path: &Path) -> Option<IdempotencyRecord> {
        let raw = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt ledger record skipped");
                None
            }
        }
    }

    async fn write_record(&self, record: &IdempotencyRecord) -> CoreResult<()> {
        let path = self.record_path(&record.namespace, &record.key_hash);
        let raw =
            serde_json::to_vec_pretty(record).map_err(|e| CoreError::Storage(e.to_string()))?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &raw)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn get(
        &self,
        namespace: &str,
        key_hash: &str,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        let _guard = self.guard.lock().await;
        Ok(self.read_record(&self.record_path(namespace, key_hash)).await)
    }

    async fn create_if_absent(&self, record: &IdempotencyRecord) -> CoreResult<bool> {
        let _guard = self.guard.lock().await;
        let path = self.record_path(&record.namespace, &record.key_hash);
        if fs::try_exists(&path)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?
        {
            return Ok(false);
        }
        self.write_record(record).await?;
        Ok(true)
    }

    async fn update_if_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: u64,
    ) -> CoreResult<bool> {
        let _guard = self.guard.lock().await;
        let path = self.record_path(&record.namespace, &record.key_hash);
        match self.read_record(&path).await {
            Some(existing) if existing.version == expected_version => {
                self.write_record(record).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn acquire_lock_if_free(
        &self,
        namespace: &str,
        key_hash: &str,
        lock_id: &str,
        lock_expires_at: DateTime<Utc>,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        let _guard = self.guard.lock().await;
        let path = self.record_path(namespace, key_hash);
        let Some(mut record) = self.read_record(&path).await else {
            return Ok(None);
        };
        if record.status == IdempotencyStatus::Completed || record.lock_is_live(Utc::now()) {
            return Ok(None);
        }
        take_lock(&mut record, lock_id, lock_expires_at);
        self.write_record(&record).await?;
        Ok(Some(record))
    }

    async fn delete(&self, namespace: &str, key_hash: &str) -> CoreResult<bool> {
        let _guard = self.guard.lock().await;
        let path = self.record_path(namespace, key_hash);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CoreError::Storage(err.to_string())),
        }
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> CoreResult<u64> {
        let _guard = self.guard.lock().await;
        let mut removed = 0u64;
        let mut read_dir = fs::read_dir(&self.base)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        while let Some(dirent) = read_dir
            .next_entry()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?
        {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read_record(&path).await {
                if record.expires_at < before {
                    let _ = fs::remove_file(&path).await;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(namespace: &str, key_hash: &str) -> IdempotencyRecord {
        IdempotencyRecord::new(namespace, key_hash, Utc::now() + Duration::hours(1))
    }

    #[tokio::test]
    async fn create_if_absent_rejects_duplicates() {
        let store = MemoryIdempotencyStore::new();
        assert!(store.create_if_absent(&record("ns", "k1")).await.unwrap());
        assert!(!store.create_if_absent(&record("ns", "k1")).await.unwrap());
        assert!(store.create_if_absent(&record("other", "k1")).await.unwrap());
    }

    #[tokio::test]
    async fn update_if_version_enforces_optimistic_locking() {
        let store = MemoryIdempotencyStore::new();
        let mut rec = record("ns", "k");
        store.create_if_absent(&rec).await.unwrap();

        rec.version = 2;
        rec.status = IdempotencyStatus::Completed;
        assert!(store.update_if_version(&rec, 1).await.unwrap());
        // the same expected version no longer matches
        assert!(!store.update_if_version(&rec, 1).await.unwrap());
    }

    #[tokio::test]
    async fn stale_lock_can_be_taken_over() {
        let store = MemoryIdempotencyStore::new();
        let mut rec = record("ns", "k");
        rec.status = IdempotencyStatus::Locked;
        rec.lock_id = Some("stale".into());
        rec.lock_expires_at = Some(Utc::now() - Duration::seconds(5));
        store.create_if_absent(&rec).await.unwrap();

        let taken = store
            .acquire_lock_if_free("ns", "k", "fresh", Utc::now() + Duration::seconds(60))
            .await
            .unwrap()
            .expect("stale lock should be free");
        assert_eq!(taken.lock_id.as_deref(), Some("fresh"));
        assert_eq!(taken.version, rec.version + 1);

        // now the lock is live and cannot be stolen
        let denied = store
            .acquire_lock_if_free("ns", "k", "thief", Utc::now() + Duration::seconds(60))
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileIdempotencyStore::open(tmp.path()).await.unwrap();

        let mut rec = record("ns", "abc");
        rec.expires_at = Utc::now() - Duration::seconds(1);
        store.create_if_absent(&rec).await.unwrap();
        assert!(store.get("ns", "abc").await.unwrap().is_some());

        let removed = store.cleanup_expired(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("ns", "abc").await.unwrap().is_none());
    }
}
