//! Event subsystem (§4.6): [`EventDispatcher`] publishes events onto a
//! service's `{service}.events` topic exchange; [`EventHandler`] subscribes
//! to another service's events under one of three dispatch styles.
//!
//! Grounded in `nameko.events`/`nameko.standalone.events.get_event_exchange`,
//! carried over onto this crate's [`crate::messaging::AmqpPublisher`] /
//! [`crate::messaging::consumer::QueueProvider`] primitives rather than
//! `kombu`'s `Exchange`/`Queue`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::container::{ContainerHandle, HandleResult, MethodHandler, ServiceDescriptor, WorkerContext, WorkerOutcome};
use crate::errors::{ConfigurationError, ContainerBeingKilled, EventHandlerConfigurationError, MessagingError};
use crate::extensions::{DependencyProvider, Entrypoint, Extension};
use crate::messaging::{
    decode_amqp_headers, decode_call_id_stack, encode_call_id_stack, AmqpPublisher, DefaultHeaderCodec, ExchangeBinding,
    HeaderCodec, PublisherConfig, QueueConsumer, QueueProvider,
};

/// How an event is distributed across listening instances (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandlerType {
    /// Pooled by service type and method: one instance per pool receives
    /// each event.
    ServicePool,
    /// One handler in the whole cluster receives each event, regardless of
    /// service type.
    Singleton,
    /// Every instance of every registered handler receives every event.
    Broadcast,
}

fn event_exchange_name(service_name: &str) -> String {
    format!("{service_name}.events")
}

/// The callable injected as a dependency: `dispatch(event_type, event_data)`
/// (§4.6). Boxed behind `Arc<dyn Any>` because [`DependencyProvider::get_dependency`]
/// is type-erased; callers downcast back to this alias.
pub type EventDispatchFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<(), MessagingError>> + Send + Sync>;

/// Injects a `dispatch` callable that publishes onto `{service}.events`
/// (§4.6). The publisher connects lazily, mirroring [`crate::rpc::Responder`]:
/// [`EventDispatcher::setup`] runs after the owning container exists, so the
/// exchange's `auto_delete`/`durable` flags can be read from config there.
pub struct EventDispatcher<S: ServiceDescriptor> {
    self_weak: Weak<Self>,
    attr_name: &'static str,
    container: ContainerHandle<S>,
    publisher_config: OnceCell<PublisherConfig>,
    publisher: OnceCell<Arc<AmqpPublisher>>,
    header_codec: Arc<dyn HeaderCodec>,
}

impl<S: ServiceDescriptor> EventDispatcher<S> {
    pub fn bind(container: ContainerHandle<S>, attr_name: &'static str) -> Arc<dyn DependencyProvider> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            attr_name,
            container,
            publisher_config: OnceCell::new(),
            publisher: OnceCell::new(),
            header_codec: Arc::new(DefaultHeaderCodec::default()),
        })
    }

    async fn publisher(&self) -> Result<&Arc<AmqpPublisher>, MessagingError> {
        let config = self
            .publisher_config
            .get()
            .expect("publisher_config set during setup, before any worker can dispatch")
            .clone();
        self.publisher.get_or_try_init(|| async { Ok::<_, MessagingError>(Arc::new(AmqpPublisher::new(config).await?)) }).await
    }

    fn build_headers(&self, ctx: &WorkerContext) -> HashMap<String, String> {
        let mut headers = self.header_codec.encode(&ctx.data);
        let (key, value) = encode_call_id_stack(self.header_codec.as_ref(), &ctx.call_id_stack);
        headers.insert(key, value);
        headers
    }

    async fn dispatch(&self, event_type: &str, event_data: &Value, extra_headers: &HashMap<String, String>) -> Result<(), MessagingError> {
        let payload = serde_json::to_vec(event_data).map_err(|e| MessagingError::Publish(e.to_string()))?;
        let mut headers = FieldTable::default();
        for (key, value) in extra_headers {
            headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        let publisher = self.publisher().await?;
        publisher.publish(event_type, &payload, headers, None, None, false).await
    }
}

#[async_trait]
impl<S: ServiceDescriptor> Extension for EventDispatcher<S> {
    async fn setup(&self) -> Result<(), ConfigurationError> {
        let container = self.container.upgrade().expect("container alive during setup");
        let mut config = PublisherConfig::new(container.config().amqp_uri.clone(), event_exchange_name(S::NAME));
        config.exchange_auto_delete = container.config().auto_delete_event_exchanges;
        let _ = self.publisher_config.set(config);
        Ok(())
    }
}

#[async_trait]
impl<S: ServiceDescriptor> DependencyProvider for EventDispatcher<S> {
    fn attr_name(&self) -> &str {
        self.attr_name
    }

    /// Builds the `dispatch` closure once per worker, capturing this
    /// worker's call-id-stack/context headers so every event it fires
    /// carries them (§3, §4.6).
    async fn get_dependency(&self, ctx: &WorkerContext) -> Arc<dyn Any + Send + Sync> {
        let extra_headers = self.build_headers(ctx);
        let this = self.self_weak.upgrade().expect("dispatcher alive while servicing a worker");
        let dispatch: EventDispatchFn = Arc::new(move |event_type: String, event_data: Value| {
            let this = this.clone();
            let extra_headers = extra_headers.clone();
            Box::pin(async move { this.dispatch(&event_type, &event_data, &extra_headers).await })
        });
        Arc::new(dispatch) as Arc<dyn Any + Send + Sync>
    }
}

/// Resolves the default broadcast identifier (§4.6), failing if it's
/// incompatible with `reliable_delivery`. Evaluated once, at bind time,
/// mirroring the source property's construction-time evaluation.
fn broadcast_identifier(handler_type: EventHandlerType, reliable_delivery: bool) -> Result<Option<String>, EventHandlerConfigurationError> {
    if handler_type != EventHandlerType::Broadcast {
        return Ok(None);
    }
    if reliable_delivery {
        return Err(EventHandlerConfigurationError(
            "broadcast handlers use a per-process identifier that does not survive a restart, \
             which is incompatible with reliable_delivery = true"
                .to_string(),
        ));
    }
    Ok(Some(uuid::Uuid::new_v4().to_string()))
}

fn event_queue_name(
    source_service: &str,
    event_type: &str,
    service_name: &str,
    method_name: &str,
    handler_type: EventHandlerType,
    broadcast_identifier: Option<&str>,
) -> String {
    match handler_type {
        EventHandlerType::ServicePool => format!("evt-{source_service}-{event_type}--{service_name}.{method_name}"),
        EventHandlerType::Singleton => format!("evt-{source_service}-{event_type}"),
        EventHandlerType::Broadcast => format!(
            "evt-{source_service}-{event_type}--{service_name}.{method_name}-{}",
            broadcast_identifier.expect("broadcast_identifier always set for EventHandlerType::Broadcast")
        ),
    }
}

/// Subscribes one service method to another service's events (§4.6).
pub struct EventHandler<S: ServiceDescriptor> {
    self_weak: Weak<Self>,
    method_name: &'static str,
    source_service: &'static str,
    event_type: &'static str,
    handler_type: EventHandlerType,
    reliable_delivery: bool,
    requeue_on_error: bool,
    broadcast_identifier: Option<String>,
    expected_exceptions: &'static [&'static str],
    sensitive_arguments: &'static [&'static str],
    container: ContainerHandle<S>,
    handler: MethodHandler<S>,
    queue_consumer: OnceCell<QueueConsumer>,
    header_codec: Arc<dyn HeaderCodec>,
}

impl<S: ServiceDescriptor> EventHandler<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        container: ContainerHandle<S>,
        handler: MethodHandler<S>,
        method_name: &'static str,
        source_service: &'static str,
        event_type: &'static str,
        handler_type: EventHandlerType,
        reliable_delivery: bool,
        requeue_on_error: bool,
        expected_exceptions: &'static [&'static str],
        sensitive_arguments: &'static [&'static str],
    ) -> Arc<dyn Entrypoint> {
        let broadcast_identifier = broadcast_identifier(handler_type, reliable_delivery)
            .unwrap_or_else(|err| panic!("{source_service}.{event_type} -> {method_name}: {err}"));
        let concrete: Arc<EventHandler<S>> = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            method_name,
            source_service,
            event_type,
            handler_type,
            reliable_delivery,
            requeue_on_error,
            broadcast_identifier,
            expected_exceptions,
            sensitive_arguments,
            container,
            handler,
            queue_consumer: OnceCell::new(),
            header_codec: Arc::new(DefaultHeaderCodec::default()),
        });
        concrete
    }
}

#[async_trait]
impl<S: ServiceDescriptor> QueueProvider for EventHandler<S> {
    fn queue_name(&self) -> String {
        event_queue_name(
            self.source_service,
            self.event_type,
            S::NAME,
            self.method_name,
            self.handler_type,
            self.broadcast_identifier.as_deref(),
        )
    }

    fn exchange_binding(&self) -> Option<ExchangeBinding> {
        Some(ExchangeBinding {
            exchange: event_exchange_name(self.source_service),
            durable: true,
            routing_key: self.event_type.to_string(),
        })
    }

    fn durable(&self) -> bool {
        true
    }

    fn auto_delete(&self) -> bool {
        !self.reliable_delivery
    }

    fn exclusive(&self) -> bool {
        self.handler_type == EventHandlerType::Broadcast && !self.reliable_delivery
    }

    async fn handle_message(&self, delivery: lapin::message::Delivery) {
        let Some(container) = self.container.upgrade() else { return };

        let event_data: Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode event payload, dropping");
                let _ = delivery.ack(BasicAckOptions::default()).await;
                return;
            }
        };

        let headers = decode_amqp_headers(&delivery.properties);
        let call_id_stack = decode_call_id_stack(self.header_codec.as_ref(), &headers);
        let mut context_data = self.header_codec.decode(&headers);
        context_data.remove("call_id_stack");

        let ctx = WorkerContext::new(
            S::NAME,
            self.method_name,
            vec![event_data],
            HashMap::new(),
            context_data,
            &call_id_stack,
            container.parent_calls_tracked(),
        );

        let requeue_on_error = self.requeue_on_error;
        let delivery_holder = Arc::new(Mutex::new(Some(delivery)));
        let handle_result: HandleResult = {
            let delivery_holder = delivery_holder.clone();
            Arc::new(move |_ctx: WorkerContext, outcome: WorkerOutcome| {
                let delivery_holder = delivery_holder.clone();
                Box::pin(async move {
                    if let Some(delivery) = delivery_holder.lock().expect("delivery mutex poisoned").take() {
                        if outcome.is_err() && requeue_on_error {
                            let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
                        } else {
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                    }
                    outcome
                }) as BoxFuture<'static, WorkerOutcome>
            })
        };

        let entrypoint = self.self_weak.upgrade().expect("alive during dispatch") as Arc<dyn Entrypoint>;
        if let Err(ContainerBeingKilled) = container.spawn_worker(entrypoint, self.handler.clone(), ctx, Some(handle_result)) {
            if let Some(delivery) = delivery_holder.lock().expect("delivery mutex poisoned").take() {
                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
            }
        }
    }
}

#[async_trait]
impl<S: ServiceDescriptor> Extension for EventHandler<S> {
    async fn setup(&self) -> Result<(), ConfigurationError> {
        let container = self.container.upgrade().expect("container alive during setup");
        let queue_consumer = crate::rpc::consumer::get_or_init_queue_consumer(&container);
        let provider = self.self_weak.upgrade().expect("alive during setup") as Arc<dyn QueueProvider>;
        queue_consumer.register_provider(provider).await;
        let _ = self.queue_consumer.set(queue_consumer);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(queue_consumer) = self.queue_consumer.get() {
            queue_consumer.unregister_provider(&self.queue_name()).await;
        }
    }

    async fn kill(&self) {
        if let Some(queue_consumer) = self.queue_consumer.get() {
            queue_consumer.unregister_provider(&self.queue_name()).await;
        }
    }
}

impl<S: ServiceDescriptor> Entrypoint for EventHandler<S> {
    fn method_name(&self) -> &str {
        self.method_name
    }

    fn expected_exceptions(&self) -> &[&'static str] {
        self.expected_exceptions
    }

    fn sensitive_arguments(&self) -> &[&'static str] {
        self.sensitive_arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_pool_queue_name_includes_method() {
        let name = event_queue_name("emitter", "thing.happened", "listener", "on_thing", EventHandlerType::ServicePool, None);
        assert_eq!(name, "evt-emitter-thing.happened--listener.on_thing");
    }

    #[test]
    fn singleton_queue_name_ignores_service_and_method() {
        let name = event_queue_name("emitter", "thing.happened", "listener", "on_thing", EventHandlerType::Singleton, None);
        assert_eq!(name, "evt-emitter-thing.happened");
    }

    #[test]
    fn broadcast_queue_name_includes_identifier() {
        let name =
            event_queue_name("emitter", "thing.happened", "listener", "on_thing", EventHandlerType::Broadcast, Some("abc123"));
        assert_eq!(name, "evt-emitter-thing.happened--listener.on_thing-abc123");
    }

    #[test]
    fn broadcast_identifier_is_generated_when_not_reliable() {
        let id = broadcast_identifier(EventHandlerType::Broadcast, false).unwrap();
        assert!(id.is_some());
    }

    #[test]
    fn broadcast_with_reliable_delivery_is_rejected() {
        assert!(broadcast_identifier(EventHandlerType::Broadcast, true).is_err());
    }

    #[test]
    fn non_broadcast_never_needs_an_identifier() {
        assert_eq!(broadcast_identifier(EventHandlerType::ServicePool, true).unwrap(), None);
        assert_eq!(broadcast_identifier(EventHandlerType::Singleton, false).unwrap(), None);
    }
}
