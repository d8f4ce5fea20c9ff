//! After-commit scheduling.
//!
//! Side effects that must never become visible for a rolled-back row (queue
//! sends, object-store uploads) are collected on a [`PostCommitQueue`] while
//! the transaction is open and dispatched only once `commit` has returned.
//! Uploads run on a semaphore-bounded pool with an explicit completion
//! callback so a failed upload can flip its row instead of leaving a message
//! pointing at a missing object.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

type BoxedAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordered list of deferred side effects bound to one transaction.
#[derive(Default)]
pub struct PostCommitQueue {
    actions: Vec<BoxedAction>,
}

impl PostCommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&mut self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::pin(action));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs the deferred actions in registration order. Must only be called
    /// after the owning transaction committed.
    pub async fn dispatch(self) {
        for action in self.actions {
            action.await;
        }
    }
}

/// Bounded worker pool for deferred object-store uploads.
#[derive(Clone)]
pub struct UploadPool {
    semaphore: Arc<Semaphore>,
}

impl UploadPool {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Runs `task` on the pool and hands its outcome to `done`. The spawned
    /// work owns a permit for its full lifetime, including the callback, so
    /// failure handling is bounded together with the uploads.
    pub fn spawn<T, D, DFut>(&self, task: T, done: D)
    where
        T: Future<Output = anyhow::Result<()>> + Send + 'static,
        D: FnOnce(anyhow::Result<()>) -> DFut + Send + 'static,
        DFut: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("upload pool closed; dropping task");
                    return;
                }
            };
            let result = task.await;
            done(result).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_runs_actions_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut queue = PostCommitQueue::new();
        for index in 0..3 {
            let seen = seen.clone();
            queue.defer(async move {
                seen.lock().unwrap().push(index);
            });
        }
        assert!(!queue.is_empty());
        queue.dispatch().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = UploadPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            pool.spawn(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                move |_| async move {
                    finished.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        for _ in 0..100 {
            if finished.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn callback_sees_task_failure() {
        let pool = UploadPool::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn(
            async { Err(anyhow::anyhow!("upload broke")) },
            move |result| async move {
                let _ = tx.send(result.is_err());
            },
        );
        assert!(rx.await.unwrap());
    }
}
