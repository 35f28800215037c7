//! In-memory storage backend for testing and embedded use

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::{
    error::{StorageError, StorageResult},
    lock::{LockBackend, StorageLock, StorageLockGuard},
    traits::*,
    types::*,
};

type LockTable = Arc<Mutex<HashMap<String, StorageLock>>>;

/// Records carry an insertion sequence so equal timestamps still order
struct Sequenced<T> {
    seq: u64,
    record: T,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
    organizations: RwLock<HashMap<OrgId, Organization>>,
    datasets: RwLock<HashMap<DatasetId, Sequenced<RawDataset>>>,
    runs: RwLock<HashMap<TrainingRunId, Sequenced<TrainingRun>>>,
    locks: LockTable,
    sequence: AtomicU64,
    offline: AtomicBool,
}

impl MemoryBackend {
    /// Create a new memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: every operation fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("memory backend is offline"));
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

fn lock_table(locks: &LockTable) -> std::sync::MutexGuard<'_, HashMap<String, StorageLock>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lock guard for the memory backend
struct MemoryLockGuard {
    lock: StorageLock,
    locks: LockTable,
}

impl MemoryLockGuard {
    fn remove_if_owned(&self) {
        let mut locks = lock_table(&self.locks);
        if locks
            .get(&self.lock.key)
            .is_some_and(|held| held.token == self.lock.token)
        {
            locks.remove(&self.lock.key);
        }
    }
}

#[async_trait]
impl StorageLockGuard for MemoryLockGuard {
    fn lock_info(&self) -> &StorageLock {
        &self.lock
    }

    async fn release(self: Box<Self>) -> StorageResult<()> {
        self.remove_if_owned();
        Ok(())
    }

    async fn is_valid(&self) -> StorageResult<bool> {
        let locks = lock_table(&self.locks);
        Ok(!self.lock.is_expired()
            && locks
                .get(&self.lock.key)
                .is_some_and(|held| held.token == self.lock.token))
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.remove_if_owned();
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        self.check_online()?;
        let mut locks = lock_table(&self.locks);

        if let Some(existing) = locks.get(key) {
            if !existing.is_expired() {
                return Err(StorageError::conflict(format!(
                    "Lock already held: {} by {}",
                    key, existing.holder
                )));
            }
        }

        let lock = StorageLock::new(key.to_string(), holder.to_string(), ttl);
        locks.insert(key.to_string(), lock.clone());

        Ok(Box::new(MemoryLockGuard {
            lock,
            locks: Arc::clone(&self.locks),
        }))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check_online()?;
        Ok(lock_table(&self.locks)
            .get(key)
            .is_some_and(|lock| !lock.is_expired()))
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn put(
        &self,
        bytes: Vec<u8>,
        bucket: &str,
        folder: &str,
        name: Option<&str>,
    ) -> StorageResult<BlobLocation> {
        self.check_online()?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = join_blob_path(folder, &name);
        let size = bytes.len() as u64;

        self.blobs
            .write()
            .await
            .insert((bucket.to_string(), path.clone()), bytes);

        Ok(BlobLocation {
            location: format!("memory://{bucket}/{path}"),
            bucket: bucket.to_string(),
            path,
            name,
            size,
        })
    }

    async fn get(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>> {
        self.check_online()?;
        self.blobs
            .read()
            .await
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("blob {bucket}/{path}")))
    }

    async fn exists(&self, bucket: &str, path: &str) -> StorageResult<bool> {
        self.check_online()?;
        Ok(self
            .blobs
            .read()
            .await
            .contains_key(&(bucket.to_string(), path.to_string())))
    }
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn save_organization(&self, organization: &Organization) -> StorageResult<()> {
        self.check_online()?;
        self.organizations
            .write()
            .await
            .insert(organization.id, organization.clone());
        Ok(())
    }

    async fn load_organization(&self, id: &OrgId) -> StorageResult<Option<Organization>> {
        self.check_online()?;
        Ok(self.organizations.read().await.get(id).cloned())
    }

    async fn save_dataset(&self, dataset: &RawDataset) -> StorageResult<()> {
        self.check_online()?;
        let mut datasets = self.datasets.write().await;
        let seq = datasets
            .get(&dataset.id)
            .map(|existing| existing.seq)
            .unwrap_or_else(|| self.next_seq());
        datasets.insert(
            dataset.id,
            Sequenced {
                seq,
                record: dataset.clone(),
            },
        );
        Ok(())
    }

    async fn load_dataset(&self, id: &DatasetId) -> StorageResult<Option<RawDataset>> {
        self.check_online()?;
        Ok(self
            .datasets
            .read()
            .await
            .get(id)
            .map(|entry| entry.record.clone()))
    }

    async fn latest_dataset(&self, filter: &DatasetFilter) -> StorageResult<Option<RawDataset>> {
        self.check_online()?;
        Ok(self
            .datasets
            .read()
            .await
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .max_by_key(|entry| (entry.record.created_at, entry.seq))
            .map(|entry| entry.record.clone()))
    }

    async fn save_training_run(&self, run: &TrainingRun) -> StorageResult<()> {
        self.check_online()?;
        let mut runs = self.runs.write().await;
        let seq = runs
            .get(&run.id)
            .map(|existing| existing.seq)
            .unwrap_or_else(|| self.next_seq());
        runs.insert(
            run.id,
            Sequenced {
                seq,
                record: run.clone(),
            },
        );
        Ok(())
    }

    async fn load_training_run(&self, id: &TrainingRunId) -> StorageResult<Option<TrainingRun>> {
        self.check_online()?;
        Ok(self.runs.read().await.get(id).map(|e| e.record.clone()))
    }

    async fn list_training_runs(&self, organization_id: &OrgId) -> StorageResult<Vec<TrainingRun>> {
        self.check_online()?;
        let runs = self.runs.read().await;
        let mut matching: Vec<&Sequenced<TrainingRun>> = runs
            .values()
            .filter(|entry| entry.record.organization_id == *organization_id)
            .collect();
        matching.sort_by(|a, b| {
            (b.record.trained_at, b.seq).cmp(&(a.record.trained_at, a.seq))
        });
        Ok(matching.into_iter().map(|e| e.record.clone()).collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let offline = self.offline.load(Ordering::SeqCst);
        Ok(HealthStatus {
            healthy: !offline,
            backend_type: "memory".to_string(),
            latency: Duration::ZERO,
            errors: if offline {
                vec!["backend is offline".to_string()]
            } else {
                vec![]
            },
        })
    }
}

pub(crate) fn join_blob_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_roundtrip_and_missing() {
        let backend = MemoryBackend::new();
        let location = backend
            .put(b"a,b\n1,2\n".to_vec(), "datasets", "org_1/raw/", Some("x.csv"))
            .await
            .unwrap();

        assert_eq!(location.path, "org_1/raw/x.csv");
        assert_eq!(location.size, 8);
        assert_eq!(location.location, "memory://datasets/org_1/raw/x.csv");
        assert_eq!(
            backend.get("datasets", &location.path).await.unwrap(),
            b"a,b\n1,2\n"
        );

        let err = backend.get("datasets", "nope.csv").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_generated_blob_names_are_unique() {
        let backend = MemoryBackend::new();
        let a = backend.put(vec![1], "b", "f", None).await.unwrap();
        let b = backend.put(vec![2], "b", "f", None).await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn test_offline_backend_is_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);

        let err = backend.get("datasets", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(!backend.health_check().await.unwrap().healthy);

        backend.set_offline(false);
        assert!(backend.health_check().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let backend = MemoryBackend::new();
        let guard = backend
            .try_acquire("train:org", "a", Duration::from_secs(30))
            .await
            .unwrap();

        let err = backend
            .try_acquire("train:org", "b", Duration::from_secs(30))
            .await
            .err()
            .unwrap();
        assert!(err.is_conflict());
        assert!(guard.is_valid().await.unwrap());

        guard.release().await.unwrap();
        assert!(!LockBackend::exists(&backend, "train:org").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let backend = MemoryBackend::new();
        {
            let _guard = backend
                .try_acquire("train:org", "a", Duration::from_secs(30))
                .await
                .unwrap();
            assert!(LockBackend::exists(&backend, "train:org").await.unwrap());
        }
        assert!(!LockBackend::exists(&backend, "train:org").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let backend = MemoryBackend::new();
        let stale = backend
            .try_acquire("train:org", "a", Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fresh = backend
            .try_acquire("train:org", "b", Duration::from_secs(30))
            .await
            .unwrap();

        // releasing the stale guard must not drop the new holder's lease
        stale.release().await.unwrap();
        assert!(fresh.is_valid().await.unwrap());
    }
}
