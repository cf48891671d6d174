// Worker pool
// Bounds concurrent task execution, with a separate budget for high-priority work

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::service::rpc::Priority;

#[derive(Clone)]
pub struct WorkerPool {
    normal: Arc<Semaphore>,
    high: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(normal: usize, high: usize) -> Self {
        Self {
            normal: Arc::new(Semaphore::new(normal.max(1))),
            high: Arc::new(Semaphore::new(high.max(1))),
        }
    }

    fn semaphore(&self, priority: Priority) -> Arc<Semaphore> {
        match priority {
            Priority::Normal => self.normal.clone(),
            Priority::High => self.high.clone(),
        }
    }

    /// Wait for a free slot of the given priority
    pub async fn permit(&self, priority: Priority) -> Option<OwnedSemaphorePermit> {
        self.semaphore(priority).acquire_owned().await.ok()
    }

    /// Run `fut` on the runtime once a slot is free
    pub fn spawn<F>(&self, priority: Priority, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = self.semaphore(priority);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            fut.await
        })
    }

    pub fn available(&self, priority: Priority) -> usize {
        self.semaphore(priority).available_permits()
    }

    pub fn close(&self) {
        self.normal.close();
        self.high.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_spawn_bounds_concurrency() {
        let pool = WorkerPool::new(2, 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(Priority::Normal, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_high_priority_not_blocked_by_normal() {
        let pool = WorkerPool::new(1, 1);
        let _held = pool.permit(Priority::Normal).await.unwrap();
        assert_eq!(pool.available(Priority::Normal), 0);
        let value = pool.spawn(Priority::High, async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
