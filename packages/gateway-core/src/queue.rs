//! Bounded FIFO queue with configurable overflow policy.
//!
//! A single conceptual producer/consumer pair per handler (see [`crate::bus`]):
//! `put` never blocks the producer, `get` suspends the consumer until an item
//! is available. Overflow is never an error for the caller — it is a policy
//! decision surfaced as a return value so the caller can log it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Overflow behavior chosen at queue construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued item before appending the new one.
    DropOldest,
    /// Leave the queue unchanged and discard the incoming item.
    DropNewest,
}

/// A fixed-capacity FIFO. Cheap to clone: the backing storage is shared.
pub struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    policy: OverflowPolicy,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue of the given capacity (`N >= 1`) and overflow policy.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity >= 1, "bounded queue capacity must be >= 1");
        Self {
            inner: Arc::new(Inner {
                capacity,
                policy,
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
            }),
        }
    }

    /// Attempts to enqueue `item`. Returns `true` if it was accepted without
    /// loss, `false` if the configured overflow policy caused a drop (either
    /// the oldest existing item, for `DropOldest`, or `item` itself, for
    /// `DropNewest`).
    pub fn put(&self, item: T) -> bool {
        let mut accepted = true;
        {
            let mut items = self.inner.items.lock();
            if items.len() >= self.inner.capacity {
                match self.inner.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        accepted = false;
                    }
                    OverflowPolicy::DropNewest => {
                        accepted = false;
                    }
                }
            } else {
                items.push_back(item);
            }
        }
        self.inner.notify.notify_one();
        accepted
    }

    /// Waits until an item is available and removes it from the front.
    pub async fn get(&self) -> T {
        loop {
            {
                let mut items = self.inner.items.lock();
                if let Some(item) = items.pop_front() {
                    return item;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drains all queued items without processing them, returning the count
    /// discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.inner.items.lock();
        let discarded = items.len();
        items.clear();
        discarded
    }

    /// Current queue depth, for overflow log records and tests.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Configured overflow policy.
    #[must_use]
    pub fn policy(&self) -> OverflowPolicy {
        self.inner.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_until_capacity() {
        let q = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        assert!(q.put(1));
        assert!(q.put(2));
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let q = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        q.put(1);
        q.put(2);
        assert!(!q.put(3));
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn drop_newest_rejects_incoming() {
        let q = BoundedQueue::new(2, OverflowPolicy::DropNewest);
        q.put(1);
        q.put(2);
        assert!(!q.put(3));
        assert_eq!(q.depth(), 2);
    }

    #[tokio::test]
    async fn get_preserves_fifo_order() {
        let q = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.get().await, 1);
        assert_eq!(q.get().await, 2);
        assert_eq!(q.get().await, 3);
    }

    #[tokio::test]
    async fn get_suspends_until_put() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.put(42);
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("task did not complete")
            .expect("task panicked");
        assert_eq!(got, 42);
    }

    #[test]
    fn clear_returns_discard_count() {
        let q = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        q.put(1);
        q.put(2);
        assert_eq!(q.clear(), 2);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be >= 1")]
    fn zero_capacity_panics() {
        let _: BoundedQueue<u8> = BoundedQueue::new(0, OverflowPolicy::DropOldest);
    }
}
