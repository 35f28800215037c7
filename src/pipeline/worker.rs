//! Bounded worker pool for background stages

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, warn};

use crate::error::ChurnError;

/// Cooperative cancellation flag shared between a handle and its stage
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Completion handle for a submitted stage.
///
/// Dropping the handle detaches the stage; it keeps running.
#[derive(Debug)]
pub struct StageHandle<T> {
    stage: &'static str,
    token: CancellationToken,
    receiver: oneshot::Receiver<T>,
}

impl<T> StageHandle<T> {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Ask the stage to stop at its next checkpoint
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the stage's outcome
    pub async fn wait(self) -> Result<T, ChurnError> {
        self.receiver.await.map_err(|_| {
            ChurnError::internal(format!("{} stage ended without reporting", self.stage))
        })
    }
}

/// Runs stages on the tokio runtime, at most `workers` at a time
#[derive(Clone)]
pub struct StageExecutor {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl StageExecutor {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Idle worker slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue `job`; it starts once a worker slot frees up
    pub fn submit<F, Fut, T>(&self, stage: &'static str, job: F) -> StageHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let (sender, receiver) = oneshot::channel();
        let permits = Arc::clone(&self.permits);
        let job_token = token.clone();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(stage, "worker pool closed; dropping stage");
                    return;
                }
            };
            debug!(stage, "stage started");
            let outcome = job(job_token).await;
            if sender.send(outcome).is_err() {
                debug!(stage, "stage finished with no one waiting");
            }
        });

        StageHandle {
            stage,
            token,
            receiver,
        }
    }
}
