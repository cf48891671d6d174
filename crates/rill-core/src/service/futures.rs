// Pending-work collector
// Gathers handles of outstanding work and waits for all of them

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use rill_common::{Result, RillError};

/// Collections larger than this drop finished entries on insert
const COMPACT_THRESHOLD: usize = 64;

/// Something that finishes later and may fail
pub trait PendingHandle: Send {
    fn is_done(&self) -> bool;

    fn wait(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

impl PendingHandle for JoinHandle<Result<()>> {
    fn is_done(&self) -> bool {
        self.is_finished()
    }

    fn wait(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match (*self).await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(RillError::InternalError(format!("task panicked: {}", e))),
            }
        })
    }
}

/// A growable set of pending handles that can be waited on as a group.
///
/// Waiting ignores cancellations and reports the first other failure, after
/// every handle has finished.
#[derive(Default)]
pub struct Futures {
    pending: Mutex<Vec<Box<dyn PendingHandle>>>,
}

impl Futures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: impl PendingHandle + 'static) {
        let mut pending = self.pending.lock();
        if pending.len() >= COMPACT_THRESHOLD {
            pending.retain(|h| !h.is_done());
        }
        pending.push(Box::new(handle));
    }

    pub fn add_boxed(&self, handle: Box<dyn PendingHandle>) {
        self.pending.lock().push(handle);
    }

    /// Move every handle of `other` into this collection
    pub fn add_all(&self, other: Futures) {
        let moved = std::mem::take(&mut *other.pending.lock());
        self.pending.lock().extend(moved);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for everything added so far, including handles added while waiting
    pub async fn block_for_pending(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                match handle.wait().await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_block_for_pending_waits_for_all() {
        let futures = Futures::new();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..10u64 {
            let done = done.clone();
            futures.add(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 3)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        futures.block_for_pending().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(futures.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_is_ignored_first_error_wins() {
        let futures = Futures::new();
        let target: SocketAddr = "127.0.0.1:5".parse().unwrap();
        futures.add(tokio::spawn(async move {
            Err(RillError::Cancelled {
                target,
                task: 1,
                reason: "gone".to_string(),
            })
        }));
        futures.add(tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(RillError::InternalError("first".to_string()))
        }));
        futures.add(tokio::spawn(async {
            Err(RillError::InternalError("second".to_string()))
        }));
        let err = futures.block_for_pending().await.unwrap_err();
        assert_eq!(err, RillError::InternalError("first".to_string()));
    }

    #[tokio::test]
    async fn test_add_all_and_aborted_handles() {
        let a = Futures::new();
        let b = Futures::new();
        let slow: JoinHandle<Result<()>> = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        slow.abort();
        b.add(slow);
        b.add(tokio::spawn(async { Ok(()) }));
        a.add_all(b);
        assert_eq!(a.len(), 2);
        a.block_for_pending().await.unwrap();
    }
}
