//! Timer entrypoint (§4.7), grounded in `nameko.timer.Timer`: a managed task
//! that ticks a service method on a wall-clock-aligned interval so that a
//! slow worker shortens, rather than resets, the wait before the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::container::{ContainerHandle, HandleResult, MethodHandler, ServiceDescriptor, WorkerContext, WorkerOutcome};
use crate::errors::{ConfigurationError, ContainerBeingKilled};
use crate::extensions::{Entrypoint, Extension};

/// Periodic-tick entrypoint (§4.7). `interval` is measured in seconds;
/// `eager` controls whether the first tick fires immediately at `start()`
/// or only after the first `interval` has elapsed.
pub struct Timer<S: ServiceDescriptor> {
    self_weak: Weak<Timer<S>>,
    method_name: &'static str,
    interval: Duration,
    eager: bool,
    expected_exceptions: &'static [&'static str],
    container: ContainerHandle<S>,
    handler: MethodHandler<S>,
    should_stop: AtomicBool,
    should_stop_notify: Notify,
    worker_complete: Notify,
    loop_finished: AtomicBool,
    loop_finished_notify: Notify,
}

impl<S: ServiceDescriptor> Timer<S> {
    pub fn bind(
        container: ContainerHandle<S>,
        handler: MethodHandler<S>,
        method_name: &'static str,
        interval: Duration,
        eager: bool,
        expected_exceptions: &'static [&'static str],
    ) -> Arc<dyn Entrypoint> {
        let concrete: Arc<Timer<S>> = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            method_name,
            interval,
            eager,
            expected_exceptions,
            container,
            handler,
            should_stop: AtomicBool::new(false),
            should_stop_notify: Notify::new(),
            worker_complete: Notify::new(),
            loop_finished: AtomicBool::new(false),
            loop_finished_notify: Notify::new(),
        });
        concrete
    }

    /// `max(start + n*interval - now, 0)` (§4.7), generated lazily one tick
    /// at a time so a long-running worker can only shrink, never grow, the
    /// wait for the next one.
    fn next_sleep(&self, start: Instant, count: u64) -> Duration {
        let target = start + self.interval.mul_f64(count as f64);
        target.saturating_duration_since(Instant::now())
    }

    async fn wait_for_stop_or(&self, sleep_time: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(sleep_time) => {}
            _ = self.should_stop_notify.notified() => {}
        }
    }

    async fn run_loop(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let start = Instant::now();
        let mut count: u64 = if self.eager { 0 } else { 1 };

        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
            let sleep_time = self.next_sleep(start, count);
            self.wait_for_stop_or(sleep_time).await;
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }

            self.tick().await?;
            self.worker_complete.notified().await;

            count += 1;
        }

        self.loop_finished.store(true, Ordering::SeqCst);
        self.loop_finished_notify.notify_waiters();
        Ok(())
    }

    async fn tick(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(container) = self.container.upgrade() else { return Ok(()) };

        let ctx = WorkerContext::new(S::NAME, self.method_name, vec![], Default::default(), Default::default(), &[], container.parent_calls_tracked());

        let this = self.self_weak.upgrade().expect("alive while ticking");
        let handle_result: HandleResult = Arc::new(move |_ctx: WorkerContext, outcome: WorkerOutcome| {
            let this = this.clone();
            Box::pin(async move {
                this.worker_complete.notify_one();
                outcome
            }) as futures::future::BoxFuture<'static, WorkerOutcome>
        });

        let entrypoint = self.self_weak.upgrade().expect("alive while ticking") as Arc<dyn Entrypoint>;
        match container.spawn_worker(entrypoint, self.handler.clone(), ctx, Some(handle_result)) {
            Ok(()) => Ok(()),
            Err(ContainerBeingKilled) => {
                // Source lets this propagate to the container's
                // thread-exited handler; `kill()` there is a no-op since the
                // container is already being killed (§4.3, §4.7).
                self.worker_complete.notify_one();
                Err(Box::new(ContainerBeingKilled))
            }
        }
    }
}

#[async_trait]
impl<S: ServiceDescriptor> Extension for Timer<S> {
    async fn start(&self) -> Result<(), ConfigurationError> {
        debug!(method = self.method_name, interval = ?self.interval, "starting timer");
        let container = self.container.upgrade().expect("container alive during start");
        let this = self.self_weak.upgrade().expect("alive during start");
        container.spawn_managed_task(async move { this.run_loop().await });
        Ok(())
    }

    /// `should_stop` short-circuits the current sleep, then this waits for
    /// the loop to actually exit before returning (§4.7, mirroring
    /// `self.gt.wait()`).
    async fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.should_stop_notify.notify_waiters();
        loop {
            let notified = self.loop_finished_notify.notified();
            if self.loop_finished.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    // `kill()` is intentionally the default no-op: the container aborts this
    // extension's managed task directly (§4.3, §4.7 — "on kill, the task is
    // forcibly terminated").
}

impl<S: ServiceDescriptor> Entrypoint for Timer<S> {
    fn method_name(&self) -> &str {
        self.method_name
    }

    fn expected_exceptions(&self) -> &[&'static str] {
        self.expected_exceptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl ServiceDescriptor for Dummy {
        const NAME: &'static str = "dummy";
        fn new_instance() -> Self {
            Dummy
        }
        fn dependencies() -> Vec<crate::container::DependencyBinding<Self>> {
            vec![]
        }
        fn entrypoints() -> Vec<crate::container::EntrypointBinding<Self>> {
            vec![]
        }
    }

    fn make_timer(interval: Duration, eager: bool) -> Arc<Timer<Dummy>> {
        let container = crate::container::ServiceContainer::<Dummy>::new(crate::config::Config::default()).unwrap();
        let handle = container.handle();
        let handler: MethodHandler<Dummy> = Arc::new(|_s, _a, _k, _d| Box::pin(async { Ok(serde_json::Value::Null) }));
        Arc::new_cyclic(|weak| Timer {
            self_weak: weak.clone(),
            method_name: "tick",
            interval,
            eager,
            expected_exceptions: &[],
            container: handle,
            handler,
            should_stop: AtomicBool::new(false),
            should_stop_notify: Notify::new(),
            worker_complete: Notify::new(),
            loop_finished: AtomicBool::new(false),
            loop_finished_notify: Notify::new(),
        })
    }

    #[test]
    fn eager_timer_starts_counting_from_zero() {
        let timer = make_timer(Duration::from_secs(5), true);
        let start = Instant::now();
        assert_eq!(timer.next_sleep(start, 0), Duration::ZERO);
    }

    #[test]
    fn non_eager_timer_waits_a_full_interval_before_first_tick() {
        let timer = make_timer(Duration::from_secs(5), false);
        let start = Instant::now();
        let sleep = timer.next_sleep(start, 1);
        assert!(sleep <= Duration::from_secs(5) && sleep > Duration::from_millis(4900));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resolves_once_the_loop_exits() {
        let timer = make_timer(Duration::from_secs(3600), false);
        let container = timer.container.upgrade().unwrap();
        let this = timer.clone();
        container.spawn_managed_task(async move { this.run_loop().await });

        tokio::task::yield_now().await;
        tokio::time::timeout(Duration::from_secs(1), timer.stop())
            .await
            .expect("stop must resolve once should_stop short-circuits the sleep");
    }
}
