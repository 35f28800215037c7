//! Scoped metadata sessions
//!
//! Every stage invocation opens its own session from a bounded pool and
//! releases it on every exit path, including unwinding, through `Drop`.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::traits::MetadataStore;

/// Bounded pool of metadata sessions
#[derive(Clone)]
pub struct SessionPool {
    store: Arc<dyn MetadataStore>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl SessionPool {
    pub fn new(store: Arc<dyn MetadataStore>, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(size.max(1))),
            acquire_timeout,
        }
    }

    /// Open a session, waiting up to the configured timeout for a free slot
    pub async fn acquire(&self) -> StorageResult<MetadataSession> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::Timeout(self.acquire_timeout))?
        .map_err(|_| StorageError::unavailable("session pool closed"))?;

        let id = Uuid::new_v4();
        trace!(session = %id, "metadata session opened");
        Ok(MetadataSession {
            id,
            store: Arc::clone(&self.store),
            _permit: permit,
        })
    }

    /// Sessions currently available
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A metadata store handle owned by exactly one stage invocation
pub struct MetadataSession {
    id: Uuid,
    store: Arc<dyn MetadataStore>,
    _permit: OwnedSemaphorePermit,
}

impl MetadataSession {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Deref for MetadataSession {
    type Target = dyn MetadataStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl Drop for MetadataSession {
    fn drop(&mut self) {
        trace!(session = %self.id, "metadata session released");
    }
}
