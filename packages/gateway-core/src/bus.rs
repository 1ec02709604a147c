//! Named publish/fan-out registry (§4.B).
//!
//! Each registered handler owns a [`BoundedQueue`] and a pool of worker
//! tasks. `publish` offers a value to every handler independently so one
//! handler's overflow never blocks another; pausing a handler stops
//! dispatch of new work to its workers while its queue keeps accepting
//! items (subject to its own overflow policy).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::queue::{BoundedQueue, OverflowPolicy};
use crate::runtime::{TaskSpawner, TokioSpawner};

/// A single bus handler. `can_handle` lets a dispatcher short-circuit
/// uninterested handlers before the (possibly expensive) `handle` call;
/// the event bus itself offers every published item to every handler and
/// leaves filtering to the handler.
#[async_trait]
pub trait BusHandler<T>: Send + Sync {
    /// Whether this handler is interested in `item`. Default accepts
    /// everything, matching handlers that have no filtering concept.
    fn can_handle(&self, _item: &T) -> bool {
        true
    }

    /// Processes one item pulled from this handler's queue. Errors are
    /// logged and swallowed by the worker loop — a single bad item must not
    /// take down the worker.
    async fn handle(&self, item: T);
}

/// Registration parameters for one handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Name used in overflow logs and for `pause`/`resume` lookups.
    pub name: String,
    /// Bound on this handler's queue.
    pub queue_max: usize,
    /// Overflow policy for this handler's queue.
    pub overflow_policy: OverflowPolicy,
    /// Number of concurrent worker tasks pulling from this handler's queue.
    pub concurrency: usize,
}

struct Registration<T> {
    queue: BoundedQueue<T>,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
    policy: OverflowPolicy,
}

/// Fan-out event bus over a single item type `T`.
///
/// Cloning an `EventBus` is cheap and shares the handler registry, since
/// the registry itself lives behind an `Arc`.
pub struct EventBus<T> {
    name: String,
    handlers: Arc<RwLock<HashMap<String, Registration<T>>>>,
    spawner: Arc<dyn TaskSpawner>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handlers: self.handlers.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<T> EventBus<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new, empty bus. `name` identifies the bus itself (e.g.
    /// `"ingress"`, `"outbound"`) in log records. Worker tasks are spawned
    /// through a [`TokioSpawner`] captured from the current runtime rather
    /// than a hard-coded `tokio::spawn`, per [`crate::runtime::TaskSpawner`].
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            spawner: Arc::new(TokioSpawner::current()),
        }
    }

    /// Registers a handler and spawns its worker pool. Re-registering the
    /// same name replaces the previous registration (its old workers keep
    /// running until their queue drains and is dropped).
    pub fn register_handler(&self, config: HandlerConfig, handler: Arc<dyn BusHandler<T>>) {
        let queue = BoundedQueue::new(config.queue_max.max(1), config.overflow_policy);
        let paused = Arc::new(AtomicBool::new(false));
        let resume_notify = Arc::new(Notify::new());

        let mut workers = Vec::with_capacity(config.concurrency.max(1));
        for worker_id in 0..config.concurrency.max(1) {
            let queue = queue.clone();
            let handler = handler.clone();
            let paused = paused.clone();
            let resume_notify = resume_notify.clone();
            let handler_name = config.name.clone();
            let bus_name = self.name.clone();

            workers.push(self.spawner.spawn(async move {
                loop {
                    if paused.load(Ordering::Acquire) {
                        resume_notify.notified().await;
                        continue;
                    }
                    let item = queue.get().await;
                    if paused.load(Ordering::Acquire) {
                        continue;
                    }
                    debug!(bus = %bus_name, handler = %handler_name, worker_id, "dispatching item");
                    handler.handle(item).await;
                }
            }));
        }

        self.handlers.write().insert(
            config.name,
            Registration {
                queue,
                paused,
                resume_notify,
                workers,
                policy: config.overflow_policy,
            },
        );
    }

    /// Offers `item` to every registered handler independently. A handler
    /// whose queue is full drops according to its own policy and logs a
    /// structured overflow warning; other handlers are unaffected.
    pub fn publish(&self, item: T) {
        let handlers = self.handlers.read();
        for (name, reg) in handlers.iter() {
            let accepted = reg.queue.put(item.clone());
            if !accepted {
                warn!(
                    bus = %self.name,
                    handler = %name,
                    depth = reg.queue.depth(),
                    policy = ?reg.policy,
                    "handler queue overflow"
                );
            }
        }
    }

    /// Stops dispatch to the named handler; its queue keeps accepting items
    /// subject to its overflow policy.
    pub fn pause(&self, name: &str) {
        if let Some(reg) = self.handlers.read().get(name) {
            reg.paused.store(true, Ordering::Release);
        }
    }

    /// Resumes dispatch to the named handler.
    pub fn resume(&self, name: &str) {
        if let Some(reg) = self.handlers.read().get(name) {
            reg.paused.store(false, Ordering::Release);
            reg.resume_notify.notify_waiters();
        }
    }

    /// Drains the named handler's queue without processing, returning the
    /// discard count.
    pub fn clear(&self, name: &str) -> usize {
        self.handlers
            .read()
            .get(name)
            .map(|reg| reg.queue.clear())
            .unwrap_or(0)
    }

    /// Drains every handler's queue.
    pub fn clear_all(&self) {
        for reg in self.handlers.read().values() {
            reg.queue.clear();
        }
    }

    /// Pauses every handler, then aborts all worker tasks. Shutdown drains
    /// nothing by design — drops under overload are intentional, and a
    /// shutting-down session should not keep processing queued work.
    pub fn shutdown(&self) {
        let mut handlers = self.handlers.write();
        for reg in handlers.values_mut() {
            reg.paused.store(true, Ordering::Release);
            for worker in &reg.workers {
                worker.abort();
            }
        }
        handlers.clear();
    }

    /// Current queue depth for the named handler, mainly for tests.
    #[must_use]
    pub fn depth(&self, name: &str) -> Option<usize> {
        self.handlers.read().get(name).map(|reg| reg.queue.depth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct CollectingHandler {
        seen: Arc<StdMutex<Vec<u32>>>,
    }

    #[async_trait]
    impl BusHandler<u32> for CollectingHandler {
        async fn handle(&self, item: u32) {
            self.seen.lock().unwrap().push(item);
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_handler() {
        let bus: EventBus<u32> = EventBus::new("test");
        let seen_a = Arc::new(StdMutex::new(Vec::new()));
        let seen_b = Arc::new(StdMutex::new(Vec::new()));

        bus.register_handler(
            HandlerConfig {
                name: "a".into(),
                queue_max: 8,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler {
                seen: seen_a.clone(),
            }),
        );
        bus.register_handler(
            HandlerConfig {
                name: "b".into(),
                queue_max: 8,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler {
                seen: seen_b.clone(),
            }),
        );

        bus.publish(1);
        bus.publish(2);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen_a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*seen_b.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn one_handler_overflow_does_not_block_another() {
        let bus: EventBus<u32> = EventBus::new("test");
        let seen_fast = Arc::new(StdMutex::new(Vec::new()));
        let processed_slow = Arc::new(AtomicUsize::new(0));

        struct SlowHandler {
            processed: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl BusHandler<u32> for SlowHandler {
            async fn handle(&self, _item: u32) {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                self.processed.fetch_add(1, Ordering::SeqCst);
            }
        }

        bus.register_handler(
            HandlerConfig {
                name: "slow".into(),
                queue_max: 1,
                overflow_policy: OverflowPolicy::DropNewest,
                concurrency: 1,
            },
            Arc::new(SlowHandler {
                processed: processed_slow.clone(),
            }),
        );
        bus.register_handler(
            HandlerConfig {
                name: "fast".into(),
                queue_max: 8,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler {
                seen: seen_fast.clone(),
            }),
        );

        for i in 0..5 {
            bus.publish(i);
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen_fast.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn pause_stops_dispatch_until_resume() {
        let bus: EventBus<u32> = EventBus::new("test");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.register_handler(
            HandlerConfig {
                name: "a".into(),
                queue_max: 8,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler { seen: seen.clone() }),
        );

        bus.pause("a");
        bus.publish(1);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(seen.lock().unwrap().is_empty());

        bus.resume("a");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
