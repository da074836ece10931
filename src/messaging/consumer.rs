//! Shared queue consumer (§4.4), grounded in `AmqpEventBus::consume_with_reconnect`
//! but generalized to multiplex many provider queues through one reconnecting
//! consumer loop rather than one bus per subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    ExchangeKind,
};
use tokio::sync::{Notify, RwLock};
use tracing::{error, info};

use crate::container::ManagedTaskSpawner;
use crate::errors::{ConfigurationError, MessagingError};
use crate::extensions::{Extension, ProviderCollector};

/// Exchange a provider's queue should be declared against and bound to.
#[derive(Clone, Debug)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub durable: bool,
    pub routing_key: String,
}

/// Implemented by anything that registers a queue with the shared consumer
/// — the RPC consumer and each event handler (§4.4). The provider owns
/// ack/requeue for every delivery on its queue, typically by spawning a
/// container worker and acking/requeueing from that worker's completion.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    fn queue_name(&self) -> String;

    /// `None` when the queue needs no binding (none of this crate's
    /// providers currently need that, but the hook matches the source's
    /// general `Queue` abstraction).
    fn exchange_binding(&self) -> Option<ExchangeBinding> {
        None
    }

    fn durable(&self) -> bool {
        true
    }

    fn auto_delete(&self) -> bool {
        false
    }

    fn exclusive(&self) -> bool {
        false
    }

    /// Extra `x-*` queue declaration arguments, e.g. the reply queue's
    /// `x-expires` (§3, §4.5 `ReplyListener`).
    fn queue_arguments(&self) -> FieldTable {
        FieldTable::default()
    }

    async fn handle_message(&self, delivery: lapin::message::Delivery);
}

struct Inner {
    pool: Pool,
    prefetch_count: u16,
    providers: RwLock<HashMap<String, Arc<dyn QueueProvider>>>,
    collector: ProviderCollector,
    ready_flag: AtomicBool,
    ready_notify: Notify,
    stopping: AtomicBool,
    spawner: Arc<dyn ManagedTaskSpawner>,
}

/// One long-lived reconnecting consumer per container, multiplexing every
/// registered provider's queue (§4.4).
#[derive(Clone)]
pub struct QueueConsumer {
    inner: Arc<Inner>,
}

impl QueueConsumer {
    pub fn new(pool: Pool, prefetch_count: u16, spawner: Arc<dyn ManagedTaskSpawner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                prefetch_count,
                providers: RwLock::new(HashMap::new()),
                collector: ProviderCollector::new(),
                ready_flag: AtomicBool::new(false),
                ready_notify: Notify::new(),
                stopping: AtomicBool::new(false),
                spawner,
            }),
        }
    }

    pub async fn register_provider(&self, provider: Arc<dyn QueueProvider>) {
        self.inner.providers.write().await.insert(provider.queue_name(), provider);
        self.inner.collector.register_provider();
    }

    pub async fn unregister_provider(&self, queue_name: &str) {
        self.inner.providers.write().await.remove(queue_name);
        self.inner.collector.unregister_provider();
    }

    /// Resolves once the consumer has successfully declared/bound every
    /// registered queue and started consuming (§4.4 — "a ready signal is
    /// fulfilled once consumers are alive").
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.inner.ready_notify.notified();
            if self.inner.ready_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn mark_ready(&self) {
        self.inner.ready_flag.store(true, Ordering::SeqCst);
        self.inner.ready_notify.notify_waiters();
    }

    async fn setup_consumers(
        &self,
    ) -> Result<impl futures::Stream<Item = (String, Result<lapin::message::Delivery, lapin::Error>)>, MessagingError> {
        let conn = self
            .inner
            .pool
            .get()
            .await
            .map_err(|e: PoolError| MessagingError::Connection(format!("failed to get pooled connection: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to create channel: {e}")))?;
        channel
            .basic_qos(self.inner.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to set qos: {e}")))?;

        let providers = self.inner.providers.read().await;
        if providers.is_empty() {
            return Err(MessagingError::Subscribe("no providers registered".to_string()));
        }

        let mut streams = Vec::with_capacity(providers.len());
        for (queue_name, provider) in providers.iter() {
            if let Some(binding) = provider.exchange_binding() {
                channel
                    .exchange_declare(
                        &binding.exchange,
                        ExchangeKind::Topic,
                        ExchangeDeclareOptions { durable: binding.durable, ..Default::default() },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| MessagingError::Subscribe(format!("failed to declare exchange `{}`: {e}", binding.exchange)))?;

                channel
                    .queue_declare(
                        queue_name,
                        QueueDeclareOptions {
                            durable: provider.durable(),
                            auto_delete: provider.auto_delete(),
                            exclusive: provider.exclusive(),
                            ..Default::default()
                        },
                        provider.queue_arguments(),
                    )
                    .await
                    .map_err(|e| MessagingError::Subscribe(format!("failed to declare queue `{queue_name}`: {e}")))?;

                channel
                    .queue_bind(queue_name, &binding.exchange, &binding.routing_key, QueueBindOptions::default(), FieldTable::default())
                    .await
                    .map_err(|e| MessagingError::Subscribe(format!("failed to bind queue `{queue_name}`: {e}")))?;
            } else {
                channel
                    .queue_declare(
                        queue_name,
                        QueueDeclareOptions {
                            durable: provider.durable(),
                            auto_delete: provider.auto_delete(),
                            exclusive: provider.exclusive(),
                            ..Default::default()
                        },
                        provider.queue_arguments(),
                    )
                    .await
                    .map_err(|e| MessagingError::Subscribe(format!("failed to declare queue `{queue_name}`: {e}")))?;
            }

            let consumer = channel
                .basic_consume(queue_name, &format!("nameko-rs-{queue_name}"), BasicConsumeOptions::default(), FieldTable::default())
                .await
                .map_err(|e| MessagingError::Subscribe(format!("failed to start consuming `{queue_name}`: {e}")))?;

            // lapin's `Delivery` doesn't retain which queue/consumer it came
            // from once merged into one stream, so tag each item with its
            // queue name before merging (`select_all` loses that
            // association otherwise).
            let tagged_queue_name = queue_name.clone();
            streams.push(consumer.map(move |item| (tagged_queue_name.clone(), item)).boxed());
        }

        Ok(futures::stream::select_all(streams))
    }

    async fn dispatch(&self, queue_name: String, delivery: lapin::message::Delivery) {
        let provider = self.inner.providers.read().await.get(&queue_name).cloned();
        match provider {
            Some(provider) => provider.handle_message(delivery).await,
            None => {
                // Provider unregistered between dispatch and delivery;
                // requeue so it isn't silently dropped.
                let _ = delivery.nack(lapin::options::BasicNackOptions { requeue: true, ..Default::default() }).await;
            }
        }
    }

    async fn run_with_reconnect(self) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        loop {
            if self.inner.stopping.load(Ordering::SeqCst) {
                return;
            }
            match self.setup_consumers().await {
                Ok(mut merged) => {
                    info!("queue consumer connected");
                    self.mark_ready();
                    backoff_iter = backoff_builder.build();

                    while let Some((queue_name, delivery)) = merged.next().await {
                        if self.inner.stopping.load(Ordering::SeqCst) {
                            return;
                        }
                        match delivery {
                            Ok(delivery) => self.dispatch(queue_name, delivery).await,
                            Err(e) => {
                                error!(error = %e, "delivery error, reconnecting");
                                break;
                            }
                        }
                    }
                    info!("consumer stream ended, reconnecting");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(error = %e, backoff_ms = delay.as_millis() as u64, "failed to set up consumers, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            if self.inner.stopping.load(Ordering::SeqCst) {
                return;
            }
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Extension for QueueConsumer {
    async fn start(&self) -> Result<(), ConfigurationError> {
        let consumer = self.clone();
        self.inner.spawner.spawn_managed(Box::pin(async move {
            consumer.run_with_reconnect().await;
            Ok(())
        }));
        Ok(())
    }

    /// Waits for the last provider to unregister (§4.4 step 4), then signals
    /// the reconnect loop to stop pulling new deliveries. If no provider
    /// ever registered, `wait_for_providers` (and therefore `stop`) is
    /// immediate.
    async fn stop(&self) {
        self.inner.collector.wait_for_providers().await;
        self.inner.stopping.store(true, Ordering::SeqCst);
    }

    async fn kill(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSpawner;
    impl ManagedTaskSpawner for NullSpawner {
        fn spawn_managed(&self, _fut: futures::future::BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>) {}
    }

    #[tokio::test]
    async fn stop_is_immediate_when_no_provider_ever_registered() {
        let pool = deadpool_lapin::Manager::new("amqp://localhost:5672".to_string(), Default::default());
        let pool = deadpool_lapin::Pool::builder(pool).max_size(1).build().unwrap();
        let consumer = QueueConsumer::new(pool, 10, Arc::new(NullSpawner));

        tokio::time::timeout(Duration::from_millis(50), consumer.stop())
            .await
            .expect("stop must not block without a prior registration");
    }
}
