// Timeout queue
// Deadline-ordered queue driving RPC resends on both sides of a call

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutKind {
    /// Sender side: resend or cancel an unanswered request
    Request,
    /// Receiver side: resend an ACK that was never ACKACKed
    AckResend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout {
    pub deadline: Instant,
    pub kind: TimeoutKind,
    pub target: SocketAddr,
    pub task: u32,
}

#[derive(Default)]
pub struct TimeoutQueue {
    heap: Mutex<BinaryHeap<Reverse<Timeout>>>,
    notify: Notify,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, deadline: Instant, kind: TimeoutKind, target: SocketAddr, task: u32) {
        self.heap.lock().push(Reverse(Timeout {
            deadline,
            kind,
            target,
            task,
        }));
        self.notify.notify_one();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|t| t.0.deadline)
    }

    /// Remove and return every entry due at `now`
    pub fn pop_expired(&self, now: Instant) -> Vec<Timeout> {
        let mut heap = self.heap.lock();
        let mut expired = Vec::new();
        while heap.peek().is_some_and(|t| t.0.deadline <= now) {
            if let Some(Reverse(t)) = heap.pop() {
                expired.push(t);
            }
        }
        expired
    }

    /// Resolves after the next `schedule`
    pub async fn scheduled(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let queue = TimeoutQueue::new();
        let now = Instant::now();
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        queue.schedule(now + Duration::from_millis(30), TimeoutKind::Request, target, 3);
        queue.schedule(now + Duration::from_millis(10), TimeoutKind::Request, target, 1);
        queue.schedule(now + Duration::from_secs(60), TimeoutKind::AckResend, target, 9);
        queue.schedule(now + Duration::from_millis(20), TimeoutKind::AckResend, target, 2);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(10)));
        let expired = queue.pop_expired(now + Duration::from_millis(30));
        let tasks: Vec<u32> = expired.iter().map(|t| t.task).collect();
        assert_eq!(tasks, vec![1, 2, 3]);
        assert_eq!(queue.len(), 1);
    }
}
