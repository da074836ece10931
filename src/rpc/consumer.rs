//! `RpcConsumer` (§4.5): the per-container shared extension that owns the
//! `rpc-{service}` queue, routes each request to the `Rpc` provider whose
//! method name matches the routing key, and replies `MethodNotFound`
//! directly for anything unmatched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lapin::options::BasicAckOptions;
use tokio::sync::RwLock;
use tracing::error;

use crate::container::{ServiceContainer, ServiceDescriptor};
use crate::errors::exception::{MalformedRequest, MethodNotFound};
use crate::errors::{serialize, ConfigurationError, SerializedException};
use crate::extensions::{Extension, ProviderCollector};
use crate::messaging::{build_pool, DefaultHeaderCodec, ExchangeBinding, HeaderCodec, PublisherConfig, QueueConsumer, QueueProvider};

use super::{request_binding_key, request_queue_name, Responder};

/// Returns (building on first call, per container) the container's single
/// shared [`QueueConsumer`], the substrate every provider queue (RPC, event
/// handlers, `ReplyListener`) is multiplexed through (§4.3, §4.4).
pub(crate) fn get_or_init_queue_consumer<S: ServiceDescriptor>(container: &ServiceContainer<S>) -> QueueConsumer {
    let handle = container.handle();
    let pool = build_pool(&container.config().amqp_uri);
    let max_workers = container.max_workers() as u16;
    (*container.shared_extension(move || Arc::new(QueueConsumer::new(pool, max_workers, Arc::new(handle))))).clone()
}

/// Returns (building on first call, per container) the container's single
/// shared [`RpcConsumer`] (§4.5).
pub(crate) fn get_or_init_rpc_consumer<S: ServiceDescriptor>(container: &ServiceContainer<S>) -> Arc<RpcConsumer> {
    let service_name = S::NAME;
    let queue_consumer = get_or_init_queue_consumer(container);
    let header_codec: Arc<dyn HeaderCodec> = Arc::new(DefaultHeaderCodec::default());
    let responder_config = PublisherConfig::new(container.config().amqp_uri.clone(), container.config().rpc_exchange.clone());
    container.shared_extension(move || {
        let responder = Arc::new(Responder::new(responder_config, header_codec));
        RpcConsumer::new(service_name, queue_consumer, responder)
    })
}

/// Implemented by `Rpc<S>`: handles one delivery already routed to its
/// method name. Type-erased so [`RpcConsumer`] doesn't need to know `S`.
#[async_trait]
pub trait RpcProvider: Send + Sync {
    async fn handle_delivery(&self, delivery: lapin::message::Delivery);
}

pub struct RpcConsumer {
    self_weak: Weak<RpcConsumer>,
    service_name: &'static str,
    queue_consumer: QueueConsumer,
    responder: Arc<Responder>,
    providers: RwLock<HashMap<String, Arc<dyn RpcProvider>>>,
    collector: ProviderCollector,
}

impl RpcConsumer {
    pub fn new(service_name: &'static str, queue_consumer: QueueConsumer, responder: Arc<Responder>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            service_name,
            queue_consumer,
            responder,
            providers: RwLock::new(HashMap::new()),
            collector: ProviderCollector::new(),
        })
    }

    pub fn responder(&self) -> Arc<Responder> {
        self.responder.clone()
    }

    pub fn header_codec(&self) -> Arc<dyn HeaderCodec> {
        self.responder.header_codec()
    }

    pub async fn register_provider(&self, method_name: &str, provider: Arc<dyn RpcProvider>) {
        self.providers.write().await.insert(method_name.to_string(), provider);
        self.collector.register_provider();
    }

    pub async fn unregister_provider(&self, method_name: &str) {
        self.providers.write().await.remove(method_name);
        self.collector.unregister_provider();
    }

    async fn reply_and_ack(&self, delivery: lapin::message::Delivery, error: SerializedException) {
        let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.as_str().to_string());
        let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.as_str().to_string());
        if let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) {
            let body = super::ReplyBody { result: None, error: Some(error) };
            if let Err(e) = self.responder.publish_reply(&reply_to, &correlation_id, &body).await {
                error!(error = %e, "failed to publish rpc error reply");
            }
        }
        // Ack after the reply publish attempt, mirroring the source: a
        // malformed/unroutable request is still considered handled once a
        // best-effort reply has gone out.
        let _ = delivery.ack(BasicAckOptions::default()).await;
    }
}

pub(super) fn request_headers(delivery: &lapin::message::Delivery) -> HashMap<String, String> {
    crate::messaging::decode_amqp_headers(&delivery.properties)
}

#[async_trait]
impl QueueProvider for RpcConsumer {
    fn queue_name(&self) -> String {
        request_queue_name(self.service_name)
    }

    fn exchange_binding(&self) -> Option<ExchangeBinding> {
        Some(ExchangeBinding {
            exchange: self.responder.exchange().to_string(),
            durable: true,
            routing_key: request_binding_key(self.service_name),
        })
    }

    async fn handle_message(&self, delivery: lapin::message::Delivery) {
        let prefix = format!("{}.", self.service_name);
        let method_name = delivery.routing_key.as_str().strip_prefix(prefix.as_str()).map(str::to_string);

        match method_name {
            Some(method_name) if !method_name.is_empty() => {
                let provider = self.providers.read().await.get(&method_name).cloned();
                match provider {
                    Some(provider) => provider.handle_delivery(delivery).await,
                    None => self.reply_and_ack(delivery, serialize(&MethodNotFound(method_name))).await,
                }
            }
            _ => self.reply_and_ack(delivery, serialize(&MalformedRequest)).await,
        }
    }
}

#[async_trait]
impl Extension for RpcConsumer {
    async fn setup(&self) -> Result<(), ConfigurationError> {
        let me = self.self_weak.upgrade().expect("alive during setup") as Arc<dyn QueueProvider>;
        self.queue_consumer.register_provider(me).await;
        Ok(())
    }

    /// Waits for every `Rpc` provider to unregister (their own `stop()` runs
    /// first in `ServiceContainer::stop`'s entrypoint phase) before
    /// unregistering the queue itself from the shared consumer.
    async fn stop(&self) {
        self.collector.wait_for_providers().await;
        self.queue_consumer.unregister_provider(&self.queue_name()).await;
    }

    async fn kill(&self) {
        self.queue_consumer.unregister_provider(&self.queue_name()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_strips_service_prefix() {
        let prefix = "math.";
        assert_eq!("math.add".strip_prefix(prefix), Some("add"));
        assert_eq!("math.".strip_prefix(prefix), Some(""));
        assert_eq!("other.add".strip_prefix(prefix), None);
    }
}
