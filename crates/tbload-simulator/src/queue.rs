//! Bounded per-worker task queues with an overflow policy.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Notify;

/// What happens when demand exceeds what the pool can absorb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued task (or the excess token) and keep going
    #[default]
    DropOldest,
    /// Hold the scheduler until there is room
    Block,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
            OverflowPolicy::Block => write!(f, "block"),
        }
    }
}

/// Result of a push.
#[derive(Debug, PartialEq)]
pub enum Pushed<T> {
    Queued,
    /// Queued after evicting the oldest task
    Evicted(T),
    /// The queue is closed; the task is handed back
    Closed(T),
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Single-producer, single-consumer bounded queue.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `item`, applying `policy` when the queue is full.
    pub async fn push(&self, item: T, policy: OverflowPolicy) -> Pushed<T> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Pushed::Closed(item);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Pushed::Queued;
                }
                if policy == OverflowPolicy::DropOldest {
                    let evicted = state.items.pop_front();
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return match evicted {
                        Some(old) => Pushed::Evicted(old),
                        None => Pushed::Queued,
                    };
                }
            }

            notified.await;
        }
    }

    /// Next task, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting tasks; consumers still drain what is queued.
    pub fn seal(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Close the queue and return whatever was still waiting.
    pub fn close(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new(4);
        for i in 0..3 {
            assert_eq!(queue.push(i, OverflowPolicy::Block).await, Pushed::Queued);
        }
        assert_eq!(queue.pop().await, Some(0));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_front() {
        let queue = TaskQueue::new(2);
        queue.push(1, OverflowPolicy::DropOldest).await;
        queue.push(2, OverflowPolicy::DropOldest).await;
        assert_eq!(queue.push(3, OverflowPolicy::DropOldest).await, Pushed::Evicted(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_waits_for_space() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(1, OverflowPolicy::Block).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2, OverflowPolicy::Block).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(producer.await.unwrap(), Pushed::Queued);
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_and_wakes_consumer() {
        let queue = Arc::new(TaskQueue::<u32>::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        assert!(queue.close().is_empty());
        assert_eq!(consumer.await.unwrap(), None);

        assert_eq!(queue.push(5, OverflowPolicy::Block).await, Pushed::Closed(5));
    }

    #[tokio::test]
    async fn test_sealed_queue_drains_then_ends() {
        let queue = TaskQueue::new(8);
        queue.push(1, OverflowPolicy::Block).await;
        queue.push(2, OverflowPolicy::Block).await;
        queue.seal();

        assert_eq!(queue.push(3, OverflowPolicy::Block).await, Pushed::Closed(3));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_returns_pending_items() {
        let queue = TaskQueue::new(8);
        queue.push("a", OverflowPolicy::Block).await;
        queue.push("b", OverflowPolicy::Block).await;
        assert_eq!(queue.close(), vec!["a", "b"]);
        assert_eq!(queue.pop().await, None);
    }
}
