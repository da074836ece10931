//! The extension model: [`Extension`] lifecycle hooks, the
//! [`DependencyProvider`] and [`Entrypoint`] specializations, the
//! type-keyed [`SharedExtensionCache`], and [`ProviderCollector`] (§4.2).
//!
//! The source binds extensions by reflecting over class-scope prototype
//! attributes and cloning them into container-bound instances. Rust has no
//! runtime reflection, so per Design Notes §9 this crate replaces prototype
//! cloning with explicit factories: a service type declares a table of
//! `{attr_name -> dependency factory}` and `{method_name -> entrypoint
//! factories}`, and [`crate::container::ServiceContainer::new`] calls each
//! factory once at construction time rather than scanning class attributes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SerializedException;

/// Four lifecycle hooks shared by every extension, all no-ops by default so
/// implementors only override what they use.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn setup(&self) -> Result<(), crate::errors::ConfigurationError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), crate::errors::ConfigurationError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn kill(&self) {}
}

/// An extension bound with an attribute name, injected onto the service
/// instance before each worker runs.
#[async_trait]
pub trait DependencyProvider: Extension {
    /// The attribute name this dependency is injected under.
    fn attr_name(&self) -> &str;

    /// Compute the value injected onto the service instance for this
    /// worker. Unlike the source, this crate has no single concrete
    /// "service instance" type to inject an arbitrary Rust value onto, so
    /// workers carry a type-erased map of resolved dependencies instead
    /// (see [`crate::container::MethodHandler`]): a JSON config snapshot
    /// (§B.1) and a callable event dispatcher (§4.6) are both valid
    /// dependency values, which plain `serde_json::Value` cannot express.
    async fn get_dependency(&self, ctx: &crate::container::WorkerContext) -> Arc<dyn Any + Send + Sync>;

    async fn worker_setup(&self, _ctx: &crate::container::WorkerContext) {}

    async fn worker_result(
        &self,
        _ctx: &crate::container::WorkerContext,
        _result: Option<&Value>,
        _error: Option<&SerializedException>,
    ) {
    }

    async fn worker_teardown(&self, _ctx: &crate::container::WorkerContext) {}
}

/// An extension bound with a method name, making that method callable from
/// outside the process (RPC request, event, timer tick).
pub trait Entrypoint: Extension {
    /// The service method this entrypoint invokes.
    fn method_name(&self) -> &str;

    /// Exception type names that are expected/"not a bug" for this
    /// entrypoint; workers log these at `warn` instead of `error`. Matched
    /// against an error's `exc_type` as produced by
    /// [`crate::errors::exception::serialize`] (the registered type's bare
    /// name, or `"RemoteError"` for anything not registered via
    /// [`crate::register_exception!`]) — never against the error's
    /// `Display` text, which for argument-bearing errors embeds the
    /// argument and would never match a bare type name.
    fn expected_exceptions(&self) -> &[&'static str] {
        &[]
    }

    /// Redaction patterns (`name`, `name.key`, `name[index]`) applied to
    /// logged call arguments.
    fn sensitive_arguments(&self) -> &[&'static str] {
        &[]
    }
}

/// Per-container cache of shared extensions, keyed by concrete type so that
/// every sub-tree referencing the same shared-extension type resolves to
/// the same bound instance (§4.2 — "SharedExtension ... keyed by type").
#[derive(Default)]
pub struct SharedExtensionCache {
    instances: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl SharedExtensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached instance of `T`, constructing it with `init` the
    /// first time it's requested. `init` is not called at all on a cache
    /// hit.
    pub fn get_or_init<T, F>(&self, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut instances = self.instances.lock().expect("shared extension cache poisoned");
        let entry = instances
            .entry(TypeId::of::<T>())
            .or_insert_with(|| init() as Arc<dyn Any + Send + Sync>);
        entry
            .clone()
            .downcast::<T>()
            .expect("shared extension cache keyed by TypeId guarantees this downcast")
    }
}

/// Mixin used by the shared queue consumer and RPC consumer to track
/// registered providers and expose a `wait_for_providers` barrier that
/// completes once the last registered provider has unregistered. If no
/// provider ever registered, the barrier is never armed and `stop` is
/// immediate (§4.2).
#[derive(Default)]
pub struct ProviderCollector {
    count: std::sync::atomic::AtomicUsize,
    ever_registered: std::sync::atomic::AtomicBool,
    drained: tokio::sync::Notify,
}

impl ProviderCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&self) {
        use std::sync::atomic::Ordering;
        self.ever_registered.store(true, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unregister_provider(&self) {
        use std::sync::atomic::Ordering;
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "unregister_provider called more often than register_provider");
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves immediately if no provider ever registered or all
    /// registered providers have already unregistered. Otherwise waits for
    /// the count to reach zero.
    pub async fn wait_for_providers(&self) {
        use std::sync::atomic::Ordering;
        if !self.ever_registered.load(Ordering::SeqCst) {
            return;
        }
        loop {
            // Register interest before re-checking the count: Notify only
            // wakes tasks that called `notified()` before `notify_waiters()`
            // ran, so the check-then-await order here must not leave a gap.
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_extension_cache_returns_same_instance() {
        struct Thing(u32);
        let cache = SharedExtensionCache::new();
        let a = cache.get_or_init(|| Arc::new(Thing(1)));
        let b = cache.get_or_init(|| Arc::new(Thing(2)));
        assert_eq!(a.0, 1);
        assert_eq!(b.0, 1, "second init closure must not run on cache hit");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn wait_for_providers_is_immediate_when_none_ever_registered() {
        let collector = ProviderCollector::new();
        tokio::time::timeout(std::time::Duration::from_millis(50), collector.wait_for_providers())
            .await
            .expect("barrier must not be armed without a registration");
    }

    #[tokio::test]
    async fn wait_for_providers_completes_after_last_unregister() {
        let collector = Arc::new(ProviderCollector::new());
        collector.register_provider();
        collector.register_provider();

        let waiter = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.wait_for_providers().await })
        };

        tokio::task::yield_now().await;
        collector.unregister_provider();
        assert!(!waiter.is_finished());
        collector.unregister_provider();

        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("barrier should complete shortly after last unregister")
            .unwrap();
    }
}
