//! [`WorkerContext`] and [`ServiceContainer`] (§3, §4.3).
//!
//! The source discovers extensions by reflecting over class-scope prototype
//! attributes declared on the service class. Rust has no such reflection,
//! so per Design Notes §9 a service is instead described by implementing
//! [`ServiceDescriptor`]: a `NAME`, a fresh-instance constructor, and two
//! explicit binding tables (`{attr_name -> dependency factory}`,
//! `{method_name -> entrypoint factory}`) that stand in for the class scan.
//! Each factory closes over a [`ContainerHandle`] — a weak, cheaply cloned
//! reference to the owning container — mirroring the source's "bound
//! instances always hold a weak reference to their container" invariant.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::concurrency::WorkerPool;
use crate::config::Config;
use crate::errors::{ConfigurationError, ContainerBeingKilled};
use crate::extensions::{DependencyProvider, Entrypoint, Extension, ProviderCollector, SharedExtensionCache};

/// Outcome of one worker invocation, pre-serialization.
pub type WorkerOutcome = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// A bound service method: given a fresh service instance, the call's
/// positional/keyword arguments, and the resolved dependency values
/// (`attr_name -> value`, the replacement for reflective attribute
/// injection), run the method body and produce a [`WorkerOutcome`].
pub type MethodHandler<S> = Arc<
    dyn Fn(Arc<S>, Vec<Value>, HashMap<String, Value>, HashMap<String, Arc<dyn Any + Send + Sync>>) -> BoxFuture<'static, WorkerOutcome>
        + Send
        + Sync,
>;

/// Optional hook passed to [`ServiceContainer::spawn_worker`] that observes
/// (and may replace) the worker's outcome before it's delivered to
/// dependencies. The RPC entrypoint uses this to publish the reply
/// (`Responder::send_response`) without the container needing to know
/// anything about RPC.
pub type HandleResult =
    Arc<dyn Fn(WorkerContext, WorkerOutcome) -> BoxFuture<'static, WorkerOutcome> + Send + Sync>;

/// Binds a dependency provider under an attribute name at container
/// construction time.
pub struct DependencyBinding<S: ServiceDescriptor> {
    pub attr_name: &'static str,
    pub build: fn(ContainerHandle<S>) -> Arc<dyn DependencyProvider>,
}

/// Binds an entrypoint under a method name at container construction time.
pub struct EntrypointBinding<S: ServiceDescriptor> {
    pub method_name: &'static str,
    pub build: fn(ContainerHandle<S>, MethodHandler<S>) -> Arc<dyn Entrypoint>,
    pub handler: MethodHandler<S>,
}

/// Implemented by the user-defined service type. Stands in for the source's
/// reflective class-attribute scan (§4.2, §9).
pub trait ServiceDescriptor: Send + Sync + Sized + 'static {
    const NAME: &'static str;

    /// A fresh instance, constructed once per worker (§4.3 — "construct a
    /// fresh service instance").
    fn new_instance() -> Self;

    fn dependencies() -> Vec<DependencyBinding<Self>>;

    fn entrypoints() -> Vec<EntrypointBinding<Self>>;
}

/// Per-invocation record: owning container, the call's arguments, and a
/// `data` map used as message-header context. Owns the call-id stack (§3).
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub service_name: String,
    pub method_name: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub data: HashMap<String, String>,
    pub call_id: String,
    pub call_id_stack: Vec<String>,
}

impl WorkerContext {
    /// Builds a fresh call-id, appends it to the inherited `parent_call_id_stack`,
    /// and trims from the oldest end so the stack never exceeds
    /// `parent_calls_tracked + 1` entries (§3, §8 invariant).
    pub fn new(
        service_name: &str,
        method_name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        data: HashMap<String, String>,
        parent_call_id_stack: &[String],
        parent_calls_tracked: usize,
    ) -> Self {
        let call_id = format!("{service_name}.{method_name}.{}", Uuid::new_v4());
        let mut stack: Vec<String> = parent_call_id_stack.to_vec();
        stack.push(call_id.clone());
        let max_len = parent_calls_tracked + 1;
        if stack.len() > max_len {
            let excess = stack.len() - max_len;
            stack.drain(0..excess);
        }
        Self {
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            args,
            kwargs,
            data,
            call_id,
            call_id_stack: stack,
        }
    }
}

/// Lifecycle state, tracked only for observability — every transition is
/// otherwise driven by `being_killed`/`died`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
    Killed,
}

type DiedOutcome = Result<(), Arc<dyn std::error::Error + Send + Sync>>;

struct ContainerInner<S: ServiceDescriptor> {
    config: Config,
    max_workers: usize,
    parent_calls_tracked: usize,
    pool: Arc<WorkerPool>,
    dependencies: Vec<Arc<dyn DependencyProvider>>,
    entrypoints: Vec<Arc<dyn Entrypoint>>,
    shared: SharedExtensionCache,
    sub_extensions: std::sync::Mutex<Vec<Arc<dyn Extension>>>,
    managed_tasks: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
    worker_tasks: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
    being_killed: AtomicBool,
    died_tx: watch::Sender<Option<DiedOutcome>>,
    died_rx: watch::Receiver<Option<DiedOutcome>>,
    state: std::sync::Mutex<ContainerState>,
    _service: std::marker::PhantomData<S>,
}

/// Hosts a [`ServiceDescriptor`], manages its lifecycle, and bounds worker
/// concurrency (§4.3).
pub struct ServiceContainer<S: ServiceDescriptor> {
    inner: Arc<ContainerInner<S>>,
}

impl<S: ServiceDescriptor> Clone for ServiceContainer<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// A weak, cheaply cloned reference to a container, handed to extension
/// factories at bind time. Prevents the container <-> extension reference
/// cycle the source avoids with Python weak references (§3, §9).
pub struct ContainerHandle<S: ServiceDescriptor> {
    inner: Weak<ContainerInner<S>>,
}

impl<S: ServiceDescriptor> Clone for ContainerHandle<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: ServiceDescriptor> ContainerHandle<S> {
    pub fn upgrade(&self) -> Option<ServiceContainer<S>> {
        self.inner.upgrade().map(|inner| ServiceContainer { inner })
    }
}

/// Type-erased handle letting shared extensions that don't know (or care)
/// about `S` — the queue consumer, the RPC consumer — submit managed
/// background tasks to the owning container (§4.3, §4.4).
pub trait ManagedTaskSpawner: Send + Sync {
    fn spawn_managed(&self, fut: BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>);
}

impl<S: ServiceDescriptor> ManagedTaskSpawner for ContainerHandle<S> {
    fn spawn_managed(&self, fut: BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>) {
        if let Some(container) = self.upgrade() {
            container.spawn_managed_task(fut);
        }
    }
}

impl<S: ServiceDescriptor> ServiceContainer<S> {
    /// Binds every dependency and entrypoint by calling its factory with a
    /// handle to the container under construction, resolving `max_workers`
    /// and `parent_calls_tracked` from `config` (§6).
    pub fn new(config: Config) -> Result<Self, ConfigurationError> {
        if S::NAME.is_empty() {
            return Err(ConfigurationError::MissingServiceName);
        }
        let max_workers = config.max_workers;
        let parent_calls_tracked = config.parent_calls_tracked;
        let (died_tx, died_rx) = watch::channel(None);

        let inner = Arc::new_cyclic(|weak: &Weak<ContainerInner<S>>| {
            let handle = ContainerHandle { inner: weak.clone() };
            let dependencies = S::dependencies()
                .into_iter()
                .map(|binding| (binding.build)(handle.clone()))
                .collect();
            let entrypoints = S::entrypoints()
                .into_iter()
                .map(|binding| (binding.build)(handle.clone(), binding.handler))
                .collect();

            ContainerInner {
                config,
                max_workers,
                parent_calls_tracked,
                pool: WorkerPool::new(max_workers),
                dependencies,
                entrypoints,
                shared: SharedExtensionCache::new(),
                sub_extensions: std::sync::Mutex::new(Vec::new()),
                managed_tasks: std::sync::Mutex::new(Vec::new()),
                worker_tasks: std::sync::Mutex::new(Vec::new()),
                being_killed: AtomicBool::new(false),
                died_tx,
                died_rx,
                state: std::sync::Mutex::new(ContainerState::Created),
                _service: std::marker::PhantomData,
            }
        });

        Ok(Self { inner })
    }

    pub fn service_name(&self) -> &'static str {
        S::NAME
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn parent_calls_tracked(&self) -> usize {
        self.inner.parent_calls_tracked
    }

    pub fn handle(&self) -> ContainerHandle<S> {
        ContainerHandle { inner: Arc::downgrade(&self.inner) }
    }

    pub fn state(&self) -> ContainerState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ContainerState) {
        *self.inner.state.lock().expect("state lock poisoned") = state;
    }

    /// Returns (or lazily builds) the container's single bound instance of
    /// a shared extension type `T`, and registers it for lifecycle
    /// iteration alongside entrypoints/dependencies (§4.2 SharedExtension).
    pub fn shared_extension<T, F>(&self, init: F) -> Arc<T>
    where
        T: Extension + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut created_new = false;
        let instance = self.inner.shared.get_or_init(|| {
            created_new = true;
            init()
        });
        if created_new {
            self.inner
                .sub_extensions
                .lock()
                .expect("sub-extension list poisoned")
                .push(instance.clone() as Arc<dyn Extension>);
        }
        instance
    }

    /// Two-phase startup: `setup()` on every extension (entrypoints,
    /// dependencies, sub-extensions), then `start()` on every extension.
    /// Ordering within a phase is unspecified; the phases themselves are
    /// globally separated (§4.3).
    pub async fn start(&self) -> Result<(), ConfigurationError> {
        // Two phases, each fanning out across all three kinds of extension
        // in turn. Entrypoint/DependencyProvider extend Extension, so
        // `.setup()`/`.start()` resolve directly through their vtable
        // without needing to unify them into a single `Arc<dyn Extension>`
        // collection (that would require trait-object upcasting, which this
        // crate avoids to stay portable across toolchains).
        for entrypoint in &self.inner.entrypoints {
            entrypoint.setup().await?;
        }
        for dependency in &self.inner.dependencies {
            dependency.setup().await?;
        }
        for sub in self.inner.sub_extensions.lock().expect("sub-extension list poisoned").iter() {
            sub.setup().await?;
        }

        for entrypoint in &self.inner.entrypoints {
            entrypoint.start().await?;
        }
        for dependency in &self.inner.dependencies {
            dependency.start().await?;
        }
        for sub in self.inner.sub_extensions.lock().expect("sub-extension list poisoned").iter() {
            sub.start().await?;
        }

        self.set_state(ContainerState::Running);
        Ok(())
    }

    /// Strictly ordered drain (§4.3): stop entrypoints, wait for the worker
    /// pool to idle, stop dependencies, stop sub-extensions, kill any
    /// managed tasks still running, fulfill `died` exactly once.
    pub async fn stop(&self) {
        if self.inner.died_rx.borrow().is_some() {
            // Already died (via a prior stop or a kill); nothing to do.
            return;
        }
        self.set_state(ContainerState::Stopping);

        for entrypoint in &self.inner.entrypoints {
            entrypoint.stop().await;
        }
        self.inner.pool.wait_idle().await;
        for dependency in &self.inner.dependencies {
            dependency.stop().await;
        }
        for sub in self.inner.sub_extensions.lock().expect("sub-extension list poisoned").iter() {
            sub.stop().await;
        }
        for task in self.inner.managed_tasks.lock().expect("managed task list poisoned").drain(..) {
            task.abort();
        }
        // `wait_idle` above already means every worker task has finished on
        // its own; this just clears out their stale abort handles.
        self.inner.worker_tasks.lock().expect("worker task list poisoned").clear();

        self.fulfill_died(Ok(()));
        self.set_state(ContainerState::Stopped);
    }

    /// Immediate terminal transition: sets `being_killed`, aborts every
    /// in-flight worker task outright (they never get a chance to run their
    /// `handle_result`/`worker_result`/`worker_teardown` tail), swallows
    /// exceptions from entrypoint `kill()`, kills dependency/sub-extensions,
    /// kills managed tasks, and fulfills `died` (§4.3, mirroring
    /// `ServiceContainer._kill_worker_threads`'s `gt.kill()` over
    /// `_worker_threads`).
    pub async fn kill(&self, cause: Option<Arc<dyn std::error::Error + Send + Sync>>) {
        if self.inner.being_killed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.worker_tasks.lock().expect("worker task list poisoned").drain(..) {
            task.abort();
        }
        for entrypoint in &self.inner.entrypoints {
            entrypoint.kill().await;
        }
        for dependency in &self.inner.dependencies {
            dependency.kill().await;
        }
        for sub in self.inner.sub_extensions.lock().expect("sub-extension list poisoned").iter() {
            sub.kill().await;
        }
        for task in self.inner.managed_tasks.lock().expect("managed task list poisoned").drain(..) {
            task.abort();
        }

        self.fulfill_died(match cause {
            Some(cause) => Err(cause),
            None => Ok(()),
        });
        self.set_state(ContainerState::Killed);
    }

    fn fulfill_died(&self, outcome: DiedOutcome) {
        self.inner.died_tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(outcome);
                true
            }
        });
    }

    /// Resolves (or re-raises) once the container has died, whether via
    /// `stop()` or `kill()`.
    pub async fn wait(&self) -> Result<(), Arc<dyn std::error::Error + Send + Sync>> {
        let mut rx = self.inner.died_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub fn being_killed(&self) -> bool {
        self.inner.being_killed.load(Ordering::SeqCst)
    }

    /// Submits a managed background task. If `fut` resolves to `Err`, the
    /// container is killed with that error as cause (§4.3, §5).
    pub fn spawn_managed_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        let container = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = fut.await {
                let err: Arc<dyn std::error::Error + Send + Sync> = Arc::from(err);
                container.kill(Some(err)).await;
            }
        });
        self.inner
            .managed_tasks
            .lock()
            .expect("managed task list poisoned")
            .push(handle.abort_handle());
    }

    /// Runs the worker body: inject dependency values, invoke the target
    /// method, route the outcome through `handle_result`, deliver
    /// `worker_result`/`worker_teardown` to every dependency (§4.3).
    pub fn spawn_worker(
        &self,
        entrypoint: Arc<dyn Entrypoint>,
        handler: MethodHandler<S>,
        ctx: WorkerContext,
        handle_result: Option<HandleResult>,
    ) -> Result<(), ContainerBeingKilled> {
        if self.inner.being_killed.load(Ordering::SeqCst) {
            return Err(ContainerBeingKilled);
        }

        let container = self.clone();
        let task = tokio::spawn(async move {
            let permit = container.inner.pool.acquire().await;
            if container.inner.being_killed.load(Ordering::SeqCst) {
                drop(permit);
                return;
            }

            let mut deps = HashMap::with_capacity(container.inner.dependencies.len());
            for dependency in &container.inner.dependencies {
                dependency.worker_setup(&ctx).await;
                let value = dependency.get_dependency(&ctx).await;
                deps.insert(dependency.attr_name().to_string(), value);
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                let redacted = crate::redaction::redact_args(&ctx.kwargs, entrypoint.sensitive_arguments());
                debug!(method = %ctx.method_name, args = ?ctx.args, kwargs = ?redacted, "calling worker");
            }

            let service = Arc::new(S::new_instance());
            let outcome = handler(service, ctx.args.clone(), ctx.kwargs.clone(), deps).await;

            if let Err(err) = &outcome {
                let exc_type = crate::errors::serialize(err.as_ref()).exc_type;
                if entrypoint.expected_exceptions().contains(&exc_type.as_str()) {
                    warn!(method = %ctx.method_name, error = %err, "expected exception in worker");
                } else {
                    error!(method = %ctx.method_name, error = %err, "unexpected exception in worker");
                }
            }

            let outcome = match handle_result {
                Some(handle_result) => handle_result(ctx.clone(), outcome).await,
                None => outcome,
            };

            let (result_value, serialized_error) = match &outcome {
                Ok(value) => (Some(value.clone()), None),
                Err(err) => (None, Some(crate::errors::serialize(err.as_ref()))),
            };
            for dependency in &container.inner.dependencies {
                dependency.worker_result(&ctx, result_value.as_ref(), serialized_error.as_ref()).await;
            }
            for dependency in &container.inner.dependencies {
                dependency.worker_teardown(&ctx).await;
            }

            drop(permit);
        });

        // Recorded synchronously, before any await in this function, so a
        // concurrent `kill()` can never observe a dispatched worker that
        // isn't yet in this list. Finished handles are pruned lazily here
        // rather than the worker removing itself, since `AbortHandle::abort`
        // on an already-completed task is a harmless no-op either way.
        let mut worker_tasks = self.inner.worker_tasks.lock().expect("worker task list poisoned");
        worker_tasks.retain(|h| !h.is_finished());
        worker_tasks.push(task.abort_handle());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_stack_is_trimmed_to_parent_calls_tracked_plus_one() {
        let parent_stack: Vec<String> = (0..5).map(|i| format!("parent.call.{i}")).collect();
        let ctx = WorkerContext::new(
            "math",
            "add",
            vec![],
            HashMap::new(),
            HashMap::new(),
            &parent_stack,
            2,
        );
        assert_eq!(ctx.call_id_stack.len(), 3);
        assert_eq!(ctx.call_id_stack.last().unwrap(), &ctx.call_id);
        assert!(ctx.call_id.starts_with("math.add."));
    }

    struct Dummy;
    impl ServiceDescriptor for Dummy {
        const NAME: &'static str = "dummy";
        fn new_instance() -> Self {
            Dummy
        }
        fn dependencies() -> Vec<DependencyBinding<Self>> {
            vec![]
        }
        fn entrypoints() -> Vec<EntrypointBinding<Self>> {
            vec![]
        }
    }

    struct NoopEntrypoint;
    impl Extension for NoopEntrypoint {}
    impl Entrypoint for NoopEntrypoint {
        fn method_name(&self) -> &str {
            "tick"
        }
    }

    #[tokio::test]
    async fn kill_aborts_an_in_flight_worker_before_it_completes() {
        let container = ServiceContainer::<Dummy>::new(Config::default()).unwrap();
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();
        let handler: MethodHandler<Dummy> = Arc::new(move |_s, _a, _k, _d| {
            let completed = completed_clone.clone();
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                completed.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });

        let ctx = WorkerContext::new("dummy", "tick", vec![], HashMap::new(), HashMap::new(), &[], 0);
        container
            .spawn_worker(Arc::new(NoopEntrypoint) as Arc<dyn Entrypoint>, handler, ctx, None)
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        container.kill(None).await;
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        assert!(!completed.load(Ordering::SeqCst), "kill() must abort the in-flight worker before it finishes");
    }

    #[test]
    fn call_id_stack_does_not_trim_when_under_budget() {
        let ctx = WorkerContext::new("math", "add", vec![], HashMap::new(), HashMap::new(), &[], 10);
        assert_eq!(ctx.call_id_stack.len(), 1);
    }
}
