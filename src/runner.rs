//! `Runner` (§4.8), grounded in `nameko.runners.ServiceRunner`: hosts
//! `{service_name -> container}` and fans `start`/`stop`/`kill`/`wait` out
//! across all of them concurrently. Generalized over [`ManagedContainer`]
//! rather than `ServiceContainer<S>` directly, since a single runner hosts
//! containers for different service types (§9 — no runtime reflection, so
//! heterogeneous containers are type-erased behind one trait object instead
//! of Python's duck typing).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::container::{ServiceContainer, ServiceDescriptor};
use crate::errors::ConfigurationError;

/// Type-erased container lifecycle, implemented for every
/// [`ServiceContainer<S>`] so [`Runner`] can hold a mix of service types.
#[async_trait]
pub trait ManagedContainer: Send + Sync {
    fn service_name(&self) -> &'static str;
    async fn start(&self) -> Result<(), ConfigurationError>;
    async fn stop(&self);
    async fn kill(&self, cause: Option<Arc<dyn std::error::Error + Send + Sync>>);
    async fn wait(&self) -> Result<(), Arc<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl<S: ServiceDescriptor> ManagedContainer for ServiceContainer<S> {
    fn service_name(&self) -> &'static str {
        ServiceContainer::service_name(self)
    }

    async fn start(&self) -> Result<(), ConfigurationError> {
        ServiceContainer::start(self).await
    }

    async fn stop(&self) {
        ServiceContainer::stop(self).await
    }

    async fn kill(&self, cause: Option<Arc<dyn std::error::Error + Send + Sync>>) {
        ServiceContainer::kill(self, cause).await
    }

    async fn wait(&self) -> Result<(), Arc<dyn std::error::Error + Send + Sync>> {
        ServiceContainer::wait(self).await
    }
}

/// Raised by [`Runner::add_service`] for a service name already registered
/// with this runner (§4.8 — "duplicate service names are rejected").
#[derive(Debug, Error)]
#[error("a service named `{0}` is already registered with this runner")]
pub struct DuplicateService(pub String);

/// Hosts multiple containers concurrently (§4.8).
#[derive(Default)]
pub struct Runner {
    containers: HashMap<String, Arc<dyn ManagedContainer>>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, container: Arc<dyn ManagedContainer>) -> Result<(), DuplicateService> {
        let name = container.service_name().to_string();
        if self.containers.contains_key(&name) {
            return Err(DuplicateService(name));
        }
        self.containers.insert(name, container);
        Ok(())
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.containers.keys().map(String::as_str).collect()
    }

    /// Starts every container concurrently, blocking until all of them have
    /// completed their own startup routine. Unlike `wait`, a failing
    /// container does not abort its siblings' in-flight startup — it mirrors
    /// `SpawningProxy(...).start()`, which gathers without `abort_on_error`.
    pub async fn start(&self) -> Result<(), ConfigurationError> {
        info!(services = ?self.service_names(), "starting services");
        let futures = self.containers.values().cloned().map(|c| async move { c.start().await });
        let results: Vec<_> = futures::future::join_all(futures).await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        info!(services = ?self.service_names(), "services started");
        Ok(())
    }

    /// Stops every container concurrently, waiting for all of them (§4.8).
    pub async fn stop(&self) {
        info!(services = ?self.service_names(), "stopping services");
        let futures = self.containers.values().cloned().map(|c| async move { c.stop().await });
        futures::future::join_all(futures).await;
    }

    /// Kills every container concurrently, waiting for all of them (§4.8).
    pub async fn kill(&self) {
        info!(services = ?self.service_names(), "killing services");
        let futures = self.containers.values().cloned().map(|c| async move { c.kill(None).await });
        futures::future::join_all(futures).await;
    }

    /// Fail-fast wait (§4.8): the first container to die aborts every other
    /// container's still-pending wait, then this stops every container and
    /// propagates the originating error, mirroring
    /// `SpawningProxy(..., abort_on_error=True).wait()` followed by the
    /// source's `except: self.stop(); raise`.
    pub async fn wait(&self) -> Result<(), Arc<dyn std::error::Error + Send + Sync>> {
        let futures = self.containers.values().cloned().map(|c| async move { c.wait().await });
        match crate::concurrency::fail_fast(futures.collect()).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.stop().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

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

    struct Other;
    impl ServiceDescriptor for Other {
        const NAME: &'static str = "other";
        fn new_instance() -> Self {
            Other
        }
        fn dependencies() -> Vec<crate::container::DependencyBinding<Self>> {
            vec![]
        }
        fn entrypoints() -> Vec<crate::container::EntrypointBinding<Self>> {
            vec![]
        }
    }

    #[test]
    fn duplicate_service_name_is_rejected() {
        let mut runner = Runner::new();
        let a = Arc::new(ServiceContainer::<Dummy>::new(Config::default()).unwrap());
        let b = Arc::new(ServiceContainer::<Dummy>::new(Config::default()).unwrap());
        runner.add_service(a).unwrap();
        let err = runner.add_service(b).unwrap_err();
        assert_eq!(err.0, "dummy");
    }

    #[test]
    fn distinct_service_names_are_both_accepted() {
        let mut runner = Runner::new();
        let a = Arc::new(ServiceContainer::<Dummy>::new(Config::default()).unwrap());
        let b = Arc::new(ServiceContainer::<Other>::new(Config::default()).unwrap());
        runner.add_service(a).unwrap();
        runner.add_service(b).unwrap();
        assert_eq!(runner.service_names().len(), 2);
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_no_services_registered() {
        let runner = Runner::new();
        tokio::time::timeout(std::time::Duration::from_millis(50), runner.wait())
            .await
            .expect("wait over an empty runner must not block")
            .unwrap();
    }
}
