//! Lease locks used to single-flight work per organization

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};

/// Storage lock information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLock {
    /// Unique lock key
    pub key: String,
    /// Lock holder identifier
    pub holder: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Time to live for the lock
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Lock token for verification
    pub token: String,
}

impl StorageLock {
    /// Create a new storage lock
    pub fn new(key: String, holder: String, ttl: Duration) -> Self {
        Self {
            key,
            holder,
            acquired_at: Utc::now(),
            ttl,
            token: Uuid::new_v4().to_string(),
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.acquired_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expiry()
    }

    /// Remaining time before lock expires
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let remaining = self.expiry() - Utc::now();
        if remaining > chrono::Duration::zero() {
            remaining.to_std().ok()
        } else {
            None
        }
    }
}

/// Lock guard; dropping it releases the lease on a best-effort basis
#[async_trait]
pub trait StorageLockGuard: Send + Sync {
    /// Get the lock information
    fn lock_info(&self) -> &StorageLock;

    /// Explicitly release the lock
    async fn release(self: Box<Self>) -> StorageResult<()>;

    /// Check if the lock is still valid
    async fn is_valid(&self) -> StorageResult<bool>;
}

/// Backend trait for different lock implementations
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to acquire a lock, failing with `Conflict` if a live lease exists
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>>;

    /// Check if a live lock exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;
}

/// Lock manager for coordinating leases
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    retry_delay: Duration,
}

impl LockManager {
    /// Create a new lock manager
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            retry_delay: Duration::from_millis(25),
        }
    }

    /// Wait for a lock to become available
    pub async fn wait_for_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> StorageResult<Box<dyn StorageLockGuard>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.backend.try_acquire(key, holder, ttl).await {
                Ok(guard) => return Ok(guard),
                Err(e) if e.is_conflict() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StorageError::Timeout(timeout));
                    }
                    debug!(key, holder, "lease busy, waiting");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let lock = StorageLock::new("org".into(), "test".into(), Duration::from_secs(60));
        assert!(!lock.is_expired());
        assert!(lock.remaining_ttl().is_some());

        let mut stale = StorageLock::new("org".into(), "test".into(), Duration::from_secs(1));
        stale.acquired_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(stale.is_expired());
        assert!(stale.remaining_ttl().is_none());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let lock = StorageLock::new("org".into(), "test".into(), Duration::MAX);
        assert!(!lock.is_expired());
    }
}
