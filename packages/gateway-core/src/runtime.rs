//! Task spawning abstraction for runtime independence.
//!
//! Allows core services to spawn background work (bus workers, idle timers,
//! the call reaper) without hard-coding a `tokio::spawn` call at every site,
//! so tests can substitute a spawner that tracks what ran. Unlike a
//! fire-and-forget spawn, callers here (the event bus's worker pool, the
//! batcher's idle timer) need to cancel what they spawned, so `spawn`
//! returns the `JoinHandle` rather than discarding it.

use std::future::Future;

use tokio::task::JoinHandle;

/// Abstraction for spawning background tasks.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task, returning a handle the caller
    /// may use to abort it. The task runs independently of the caller
    /// otherwise; dropping the handle does not cancel the task.
    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner used by every component in this crate.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tokio_spawner_executes_task() {
        let spawner = TokioSpawner::current();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let _handle = spawner.spawn(async move {
            executed_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn returned_handle_can_abort_the_task() {
        let spawner = TokioSpawner::current();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let handle = spawner.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            executed_clone.store(true, Ordering::SeqCst);
        });
        handle.abort();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(!executed.load(Ordering::SeqCst));
    }
}
