//! Concurrency helpers shared by the container and the runner (§5).
//!
//! The source relies on a single-threaded green-thread scheduler where
//! blocking I/O transparently yields. Per Design Notes §9 this crate uses a
//! real multi-threaded task runtime instead: the worker pool becomes a
//! bounded [`tokio::sync::Semaphore`], and the shared mutable maps the
//! source protects implicitly (provider sets, correlation-id tables) are
//! guarded by `tokio::sync` primitives at their point of use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Bounds worker concurrency to `max_workers` and exposes an idle barrier so
/// `ServiceContainer::stop` can wait for every in-flight worker to finish
/// before tearing down dependencies (§4.3 step 2). Acquiring a permit here
/// is also the backpressure mechanism: the queue consumer's prefetch is set
/// equal to `max_workers`, so the broker stops handing out messages exactly
/// when this pool is full (§5).
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Acquire a worker slot, waiting until one is free.
    pub async fn acquire(self: &Arc<Self>) -> WorkerPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkerPermit {
            pool: self.clone(),
            _permit: permit,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves immediately if no worker is in flight, otherwise waits for
    /// the in-flight count to reach zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard for one worker-pool slot. Dropping it (worker finished, or
/// panicked and unwound) always releases the slot and wakes `wait_idle`.
pub struct WorkerPermit {
    pool: Arc<WorkerPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        if self.pool.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.idle.notify_waiters();
        }
    }
}

/// Runs every future concurrently to completion, short-circuiting as soon
/// as one resolves to `Err`: the remaining futures are aborted and the
/// first error is returned. Backs [`crate::runner::Runner::wait`] (§4.8 —
/// "fail-fast parallel map over containers"), which aborts its siblings'
/// wait futures this way before stopping every container explicitly.
pub async fn fail_fast<F, T, E>(futures: Vec<F>) -> Result<Vec<T>, E>
where
    F: std::future::Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut set = tokio::task::JoinSet::new();
    for fut in futures {
        set.spawn(fut);
    }
    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined.expect("fan-out task panicked") {
            Ok(value) => results.push(value),
            Err(err) => {
                set.abort_all();
                return Err(err);
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_serializes_beyond_capacity() {
        let pool = WorkerPool::new(1);
        let first = pool.acquire().await;
        assert_eq!(pool.in_flight(), 1);

        let pool2 = pool.clone();
        let second = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second acquire must block while the only slot is held");

        drop(first);
        let _second_permit = second.await.unwrap();
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn wait_idle_resolves_once_all_permits_drop() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.wait_idle().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        assert!(!waiter.is_finished());
        drop(b);

        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("wait_idle should resolve after the last permit drops")
            .unwrap();
    }

    #[tokio::test]
    async fn fail_fast_returns_first_error() {
        let futures: Vec<_> = vec![
            Box::pin(async { Ok::<_, &'static str>(1) }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<i32, &'static str>> + Send>>,
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err("boom")
            }),
        ];
        let result = fail_fast(futures).await;
        assert_eq!(result, Err("boom"));
    }
}
