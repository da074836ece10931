//! `ReplyListener` (§4.5): the shared extension that owns a caller process's
//! single `rpc.reply-{service}-{uuid}` queue and matches inbound replies to
//! waiting callers by `correlation_id`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use lapin::options::BasicAckOptions;
use lapin::types::{AMQPValue, FieldTable};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ConfigurationError;
use crate::extensions::Extension;
use crate::messaging::{ExchangeBinding, QueueConsumer, QueueProvider};

use super::{reply_queue_name, ReplyBody, REPLY_QUEUE_EXPIRES_MS};

pub struct ReplyListener {
    self_weak: Weak<ReplyListener>,
    service_name: &'static str,
    instance_id: Uuid,
    rpc_exchange: String,
    queue_consumer: QueueConsumer,
    reply_events: Mutex<HashMap<String, oneshot::Sender<ReplyBody>>>,
}

impl ReplyListener {
    pub fn new(service_name: &'static str, rpc_exchange: String, queue_consumer: QueueConsumer) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            service_name,
            instance_id: Uuid::new_v4(),
            rpc_exchange,
            queue_consumer,
            reply_events: Mutex::new(HashMap::new()),
        })
    }

    /// The routing key a [`super::MethodProxy`] sets as `reply_to` (§3, §4.5
    /// — "routing key equal to that uuid").
    pub fn routing_key(&self) -> String {
        self.instance_id.to_string()
    }

    /// Registers a one-shot reply slot for `correlation_id`, to be fulfilled
    /// by [`ReplyListener::handle_message`] when the matching reply arrives.
    pub fn register_reply(&self, correlation_id: String) -> oneshot::Receiver<ReplyBody> {
        let (tx, rx) = oneshot::channel();
        self.reply_events.lock().expect("reply_events mutex poisoned").insert(correlation_id, tx);
        rx
    }
}

#[async_trait]
impl QueueProvider for ReplyListener {
    fn queue_name(&self) -> String {
        reply_queue_name(self.service_name, &self.instance_id)
    }

    fn exchange_binding(&self) -> Option<ExchangeBinding> {
        Some(ExchangeBinding { exchange: self.rpc_exchange.clone(), durable: true, routing_key: self.routing_key() })
    }

    /// Abandoned reply queues self-destruct via `x-expires` instead of
    /// `auto_delete` (§3), since the TTL must survive brief disconnects.
    fn auto_delete(&self) -> bool {
        false
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert("x-expires".into(), AMQPValue::LongInt(REPLY_QUEUE_EXPIRES_MS as i32));
        args
    }

    async fn handle_message(&self, delivery: lapin::message::Delivery) {
        let _ = delivery.ack(BasicAckOptions::default()).await;

        let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.as_str().to_string());
        let Some(correlation_id) = correlation_id else {
            debug!("rpc reply missing correlation_id, dropping");
            return;
        };

        let waiter = self.reply_events.lock().expect("reply_events mutex poisoned").remove(&correlation_id);
        match waiter {
            Some(tx) => match serde_json::from_slice::<ReplyBody>(&delivery.data) {
                Ok(body) => {
                    let _ = tx.send(body);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to decode rpc reply body");
                }
            },
            None => debug!(%correlation_id, "unknown correlation id, dropping reply"),
        }
    }
}

#[async_trait]
impl Extension for ReplyListener {
    async fn setup(&self) -> Result<(), ConfigurationError> {
        let provider = self.self_weak.upgrade().expect("alive during setup") as Arc<dyn QueueProvider>;
        self.queue_consumer.register_provider(provider).await;
        Ok(())
    }

    async fn stop(&self) {
        self.queue_consumer.unregister_provider(&self.queue_name()).await;
    }

    async fn kill(&self) {
        self.queue_consumer.unregister_provider(&self.queue_name()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> deadpool_lapin::Pool {
        let manager = deadpool_lapin::Manager::new("amqp://localhost:5672".to_string(), Default::default());
        deadpool_lapin::Pool::builder(manager).max_size(1).build().unwrap()
    }

    struct NullSpawner;
    impl crate::container::ManagedTaskSpawner for NullSpawner {
        fn spawn_managed(&self, _fut: futures::future::BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>) {}
    }

    #[test]
    fn queue_name_and_routing_key_are_derived_from_the_same_instance_id() {
        let queue_consumer = QueueConsumer::new(test_pool(), 10, Arc::new(NullSpawner));
        let listener = ReplyListener::new("math", "nameko-rpc".to_string(), queue_consumer);
        assert!(listener.queue_name().starts_with("rpc.reply-math-"));
        assert!(listener.queue_name().ends_with(&listener.routing_key()));
    }

    #[tokio::test]
    async fn unregistered_correlation_id_is_reported_via_waiter_absence() {
        let queue_consumer = QueueConsumer::new(test_pool(), 10, Arc::new(NullSpawner));
        let listener = ReplyListener::new("math", "nameko-rpc".to_string(), queue_consumer);
        let rx = listener.register_reply("abc".to_string());
        // Simulate a reply for a *different* correlation id never arriving;
        // the registered waiter is simply never fulfilled.
        drop(listener);
        assert!(rx.await.is_err());
    }
}
