//! File-based storage backend implementation
//!
//! Layout under the base directory:
//! - `blobs/<bucket>/<path>` raw blob bytes
//! - `organizations/<id>.json`, `datasets/<id>.json`, `training_runs/<id>.json`
//! - `locks/<key>.lock` lease files holding a serialized `StorageLock`

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use super::memory::join_blob_path;
use crate::storage::{
    error::{StorageError, StorageResult},
    lock::{LockBackend, StorageLock, StorageLockGuard},
    traits::*,
    types::*,
};

/// File-based storage backend
pub struct FileBackend {
    base_dir: PathBuf,
}

impl FileBackend {
    /// Create a new file backend rooted at `base_dir`
    pub async fn new(base_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get path for a specific storage domain
    fn get_path(&self, domain: &str, key: &str) -> PathBuf {
        self.base_dir.join(domain).join(key)
    }

    fn blob_path(&self, bucket: &str, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || bucket.is_empty() || bucket.contains('/') || bucket.contains('\\') {
            return Err(StorageError::configuration(format!(
                "invalid blob address {bucket}/{path}"
            )));
        }
        Ok(self.base_dir.join("blobs").join(bucket).join(relative))
    }

    /// Ensure directory exists
    async fn ensure_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Read JSON file, `None` when the file does not exist
    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StorageResult<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write JSON via a temp file + rename so readers never see partial records
    async fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> StorageResult<()> {
        let content = serde_json::to_vec_pretty(data)?;
        self.write_atomic(path, &content).await
    }

    async fn write_atomic(&self, path: &Path, content: &[u8]) -> StorageResult<()> {
        self.ensure_dir(path).await?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load every JSON record in a domain directory
    async fn read_all<T: DeserializeOwned>(&self, domain: &str) -> StorageResult<Vec<T>> {
        let dir = self.base_dir.join(domain);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.get_path("locks", &format!("{safe}.lock"))
    }
}

/// File-based lock guard; the lease file is removed on release or drop
pub struct FileLockGuard {
    lock: StorageLock,
    lock_file: PathBuf,
}

impl FileLockGuard {
    fn owns_file(&self) -> bool {
        std::fs::read_to_string(&self.lock_file)
            .ok()
            .and_then(|content| serde_json::from_str::<StorageLock>(&content).ok())
            .is_some_and(|held| held.token == self.lock.token)
    }
}

#[async_trait]
impl StorageLockGuard for FileLockGuard {
    fn lock_info(&self) -> &StorageLock {
        &self.lock
    }

    async fn release(self: Box<Self>) -> StorageResult<()> {
        if self.owns_file() {
            fs::remove_file(&self.lock_file).await?;
        }
        Ok(())
    }

    async fn is_valid(&self) -> StorageResult<bool> {
        Ok(!self.lock.is_expired() && self.owns_file())
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Best-effort cleanup in drop
        if self.owns_file() {
            let _ = std::fs::remove_file(&self.lock_file);
        }
    }
}

#[async_trait]
impl LockBackend for FileBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        let lock_file = self.lock_path(key);
        self.ensure_dir(&lock_file).await?;

        // Clear a stale lease left behind by a crashed holder
        if let Some(existing) = self.read_json::<StorageLock>(&lock_file).await.ok().flatten() {
            if existing.is_expired() {
                warn!(key, holder = %existing.holder, "removing expired lease");
                let _ = fs::remove_file(&lock_file).await;
            }
        }

        // Try to create lock file exclusively
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
            .await
        {
            Ok(mut file) => {
                let lock = StorageLock::new(key.to_string(), holder.to_string(), ttl);
                file.write_all(&serde_json::to_vec(&lock)?).await?;
                file.flush().await?;
                Ok(Box::new(FileLockGuard { lock, lock_file }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StorageError::conflict(
                format!("Lock already held: {}", key),
            )),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .read_json::<StorageLock>(&self.lock_path(key))
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }
}

#[async_trait]
impl BlobStore for FileBackend {
    async fn put(
        &self,
        bytes: Vec<u8>,
        bucket: &str,
        folder: &str,
        name: Option<&str>,
    ) -> StorageResult<BlobLocation> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = join_blob_path(folder, &name);
        let file = self.blob_path(bucket, &path)?;
        let size = bytes.len() as u64;

        self.write_atomic(&file, &bytes).await?;

        Ok(BlobLocation {
            location: format!("file://{}", file.display()),
            bucket: bucket.to_string(),
            path,
            name,
            size,
        })
    }

    async fn get(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>> {
        let file = self.blob_path(bucket, path)?;
        match fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(format!("blob {bucket}/{path}")))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, bucket: &str, path: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.blob_path(bucket, path)?).await?)
    }
}

#[async_trait]
impl MetadataStore for FileBackend {
    async fn save_organization(&self, organization: &Organization) -> StorageResult<()> {
        let path = self.get_path("organizations", &format!("{}.json", organization.id));
        self.write_json(&path, organization).await
    }

    async fn load_organization(&self, id: &OrgId) -> StorageResult<Option<Organization>> {
        let path = self.get_path("organizations", &format!("{id}.json"));
        self.read_json(&path).await
    }

    async fn save_dataset(&self, dataset: &RawDataset) -> StorageResult<()> {
        let path = self.get_path("datasets", &format!("{}.json", dataset.id));
        self.write_json(&path, dataset).await
    }

    async fn load_dataset(&self, id: &DatasetId) -> StorageResult<Option<RawDataset>> {
        let path = self.get_path("datasets", &format!("{id}.json"));
        self.read_json(&path).await
    }

    async fn latest_dataset(&self, filter: &DatasetFilter) -> StorageResult<Option<RawDataset>> {
        let datasets: Vec<RawDataset> = self.read_all("datasets").await?;
        Ok(datasets
            .into_iter()
            .filter(|dataset| filter.matches(dataset))
            .max_by_key(|dataset| dataset.created_at))
    }

    async fn save_training_run(&self, run: &TrainingRun) -> StorageResult<()> {
        let path = self.get_path("training_runs", &format!("{}.json", run.id));
        self.write_json(&path, run).await
    }

    async fn load_training_run(&self, id: &TrainingRunId) -> StorageResult<Option<TrainingRun>> {
        let path = self.get_path("training_runs", &format!("{id}.json"));
        self.read_json(&path).await
    }

    async fn list_training_runs(&self, organization_id: &OrgId) -> StorageResult<Vec<TrainingRun>> {
        let mut runs: Vec<TrainingRun> = self
            .read_all::<TrainingRun>("training_runs")
            .await?
            .into_iter()
            .filter(|run| run.organization_id == *organization_id)
            .collect();
        runs.sort_by(|a, b| b.trained_at.cmp(&a.trained_at));
        Ok(runs)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let start = std::time::Instant::now();

        // Try to write a test file
        let test_file = self.base_dir.join(".health_check");
        let result = fs::write(&test_file, "health_check").await;
        let _ = fs::remove_file(&test_file).await;

        Ok(HealthStatus {
            healthy: result.is_ok(),
            backend_type: "file".to_string(),
            latency: start.elapsed(),
            errors: result.err().map(|e| e.to_string()).into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_blob_paths_cannot_escape_base_dir() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path()).await.unwrap();

        assert!(backend.get("datasets", "../secrets").await.is_err());
        assert!(backend
            .put(vec![1], "datasets", "/etc", Some("passwd"))
            .await
            .is_ok());
        assert!(backend.put(vec![1], "../x", "f", None).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_lock_file_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path()).await.unwrap();

        let stale = backend
            .try_acquire("train:org", "crashed", Duration::ZERO)
            .await
            .unwrap();
        // simulate a crash: the guard never runs its cleanup
        std::mem::forget(stale);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fresh = backend
            .try_acquire("train:org", "live", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(fresh.lock_info().holder, "live");
        assert!(LockBackend::exists(&backend, "train:org").await.unwrap());

        fresh.release().await.unwrap();
        assert!(!LockBackend::exists(&backend, "train:org").await.unwrap());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let org = Organization {
            id: OrgId::new(),
            name: "Acme".into(),
            churn_threshold_days: 45,
            created_at: chrono::Utc::now(),
        };

        {
            let backend = FileBackend::new(temp.path()).await.unwrap();
            backend.save_organization(&org).await.unwrap();
        }

        let reopened = FileBackend::new(temp.path()).await.unwrap();
        assert_eq!(reopened.load_organization(&org.id).await.unwrap(), Some(org));
        assert_eq!(reopened.load_organization(&OrgId::new()).await.unwrap(), None);
    }
}
