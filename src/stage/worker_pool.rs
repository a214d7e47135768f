//! Bounded pool for per-datapoint work inside a single stage.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::StageError;

/// Runs blocking per-item work with at most `workers` items in flight.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    limit: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            limit: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Applies `work` to every item on the blocking thread pool.
    ///
    /// Results keep the order of `items`. All items run to completion even
    /// when some fail; the first error in item order is returned.
    pub async fn map_blocking<T, R, F>(&self, items: Vec<T>, work: F) -> Result<Vec<R>, StageError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R, StageError> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let tasks = items.into_iter().map(|item| {
            let limit = Arc::clone(&self.limit);
            let work = Arc::clone(&work);
            async move {
                let _permit = limit.acquire_owned().await.map_err(|e| StageError::Failed {
                    stage: "worker pool".to_string(),
                    message: e.to_string(),
                })?;
                tokio::task::spawn_blocking(move || work(item))
                    .await
                    .map_err(|e| StageError::Failed {
                        stage: "worker pool".to_string(),
                        message: format!("worker panicked: {}", e),
                    })?
            }
        });

        let outcomes = join_all(tasks).await;
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if failed > 0 {
            warn!(failed, total = outcomes.len(), "Worker pool items failed");
        }
        outcomes.into_iter().collect()
    }

    /// Like [`WorkerPool::map_blocking`] for work without a result.
    pub async fn for_each_blocking<T, F>(&self, items: Vec<T>, work: F) -> Result<(), StageError>
    where
        T: Send + 'static,
        F: Fn(T) -> Result<(), StageError> + Send + Sync + 'static,
    {
        self.map_blocking(items, work).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_map_preserves_order() {
        let pool = WorkerPool::new(3);
        let out = pool
            .map_blocking((0..50).collect(), |i: u32| Ok(i * 2))
            .await
            .unwrap();
        assert_eq!(out, (0..50).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        pool.for_each_blocking((0..16).collect(), move |_: u32| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_first_error_is_returned() {
        let pool = WorkerPool::new(4);
        let err = pool
            .for_each_blocking(vec![1, 2, 3], |i: u32| {
                if i >= 2 {
                    Err(StageError::Failed {
                        stage: "test".to_string(),
                        message: format!("item {}", i),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("item 2"));
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
