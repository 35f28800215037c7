//! Per-organization training lease

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChurnError;
use crate::storage::{LockBackend, LockManager, OrgId, StorageError, StorageLockGuard};

/// Serializes training runs per organization with a storage-backed lease
pub struct SingleFlight {
    manager: LockManager,
    ttl: Duration,
    wait: Duration,
}

impl SingleFlight {
    pub fn new(locks: Arc<dyn LockBackend>, ttl: Duration, wait: Duration) -> Self {
        Self {
            manager: LockManager::new(locks),
            ttl,
            wait,
        }
    }

    pub fn key(org_id: &OrgId) -> String {
        format!("training:{org_id}")
    }

    /// Wait for the organization's lease; `holder` identifies the run
    pub async fn acquire(
        &self,
        org_id: &OrgId,
        holder: &str,
    ) -> Result<TrainingLease, ChurnError> {
        let key = Self::key(org_id);
        match self
            .manager
            .wait_for_lock(&key, holder, self.ttl, self.wait)
            .await
        {
            Ok(guard) => {
                debug!(%org_id, holder, "training lease acquired");
                Ok(TrainingLease { guard: Some(guard) })
            }
            Err(StorageError::Timeout(waited)) => Err(ChurnError::internal(format!(
                "another training run for organization {org_id} held the lease for over {waited:?}"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held while a training run is in flight; dropping it frees the lease
pub struct TrainingLease {
    guard: Option<Box<dyn StorageLockGuard>>,
}

impl TrainingLease {
    pub async fn release(mut self) {
        if let Some(guard) = self.guard.take() {
            let key = guard.lock_info().key.clone();
            if let Err(e) = guard.release().await {
                warn!(key, error = %e, "failed to release training lease");
            }
        }
    }
}
