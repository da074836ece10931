//! AMQP publisher (§4.1), grounded directly in `AmqpEventBus`'s connection
//! pooling and retry-with-backoff. A publisher here is generic over the
//! exchange it targets — both the RPC subsystem (request/reply on
//! `nameko-rpc`) and the event subsystem (`{service}.events`) build one of
//! these rather than each hand-rolling broker I/O.

use std::sync::Mutex;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    message::BasicReturnMessage,
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::errors::MessagingError;

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub amqp_uri: String,
    pub exchange: String,
    pub exchange_durable: bool,
    /// §4.6 `AUTO_DELETE_EVENT_EXCHANGES` — the RPC exchange never sets
    /// this, only the per-service event exchange.
    pub exchange_auto_delete: bool,
    /// Default `content_type` set on published messages (§4.1 — "default
    /// serializer (json)").
    pub serializer: String,
    pub max_retries: usize,
}

impl PublisherConfig {
    pub fn new(amqp_uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            amqp_uri: amqp_uri.into(),
            exchange: exchange.into(),
            exchange_durable: true,
            exchange_auto_delete: false,
            serializer: "application/json".to_string(),
            max_retries: 3,
        }
    }
}

/// A pooled connection to one AMQP topic exchange with publish retry and
/// mandatory-delivery undeliverable-message detection.
pub struct AmqpPublisher {
    pool: Pool,
    config: PublisherConfig,
}

impl AmqpPublisher {
    /// Connects, verifies the connection, and declares the exchange
    /// (durable topic) before returning — mirroring `AmqpEventBus::new`.
    pub async fn new(config: PublisherConfig) -> Result<Self, MessagingError> {
        let manager = Manager::new(config.amqp_uri.clone(), deadpool_lapin::ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| MessagingError::Connection(format!("failed to build pool: {e}")))?;

        let conn = pool
            .get()
            .await
            .map_err(|e: PoolError| MessagingError::Connection(format!("failed to connect: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to create channel: {e}")))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: config.exchange_durable, auto_delete: config.exchange_auto_delete, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to declare exchange `{}`: {e}", config.exchange)))?;

        info!(exchange = %config.exchange, "declared AMQP exchange");
        Ok(Self { pool, config })
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    async fn channel(&self) -> Result<Channel, MessagingError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| MessagingError::Connection(format!("failed to get pooled connection: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to create channel: {e}")))
    }

    /// One publish attempt, with retry on connection/publish errors (bounded
    /// exponential backoff with jitter, matching `AmqpEventBus::publish`).
    /// `mandatory` + publisher confirms let the caller detect NO_ROUTE
    /// synchronously as [`MessagingError::UndeliverableMessage`] (§4.1, §8).
    #[tracing::instrument(name = "messaging.publish", skip(self, payload, headers), fields(exchange = %self.config.exchange, %routing_key))]
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
        mandatory: bool,
    ) -> Result<(), MessagingError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.config.max_retries)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.publish_once(routing_key, payload, headers.clone(), reply_to, correlation_id, mandatory).await {
                Ok(()) => return Ok(()),
                Err(MessagingError::UndeliverableMessage) => return Err(MessagingError::UndeliverableMessage),
                Err(e) => {
                    error!(attempt = attempt + 1, max_retries = self.config.max_retries, error = %e, "publish failed, retrying");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| MessagingError::Publish("max retries exceeded".to_string())))
    }

    async fn publish_once(
        &self,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
        mandatory: bool,
    ) -> Result<(), MessagingError> {
        let channel = self.channel().await?;

        // `on_return` fires if the broker could not route a `mandatory`
        // publish to any queue. AMQP delivers `basic.return` ahead of the
        // matching `basic.ack` on the same channel, but lapin surfaces it
        // through an independent callback, so we give it a short grace
        // window after the confirm resolves rather than assuming ordering
        // we can't observe directly.
        let (return_tx, return_rx) = oneshot::channel::<BasicReturnMessage>();
        let return_tx = Mutex::new(Some(return_tx));
        channel.on_return(move |message| {
            if let Some(tx) = return_tx.lock().expect("return_tx mutex poisoned").take() {
                let _ = tx.send(message);
            }
        });

        let mut properties = BasicProperties::default()
            .with_content_type(self.config.serializer.as_str().into())
            .with_delivery_mode(2)
            .with_headers(headers);
        if let Some(reply_to) = reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let options = BasicPublishOptions { mandatory, ..Default::default() };

        let confirm = channel
            .basic_publish(&self.config.exchange, routing_key, options, payload, properties)
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        confirm.await.map_err(|e| MessagingError::Publish(format!("publish not confirmed: {e}")))?;

        if mandatory {
            if tokio::time::timeout(Duration::from_millis(50), return_rx).await.is_ok() {
                return Err(MessagingError::UndeliverableMessage);
            }
        }

        debug!(exchange = %self.config.exchange, %routing_key, "published message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_config_defaults() {
        let config = PublisherConfig::new("amqp://localhost:5672", "nameko-rpc");
        assert_eq!(config.exchange, "nameko-rpc");
        assert_eq!(config.serializer, "application/json");
        assert_eq!(config.max_retries, 3);
        assert!(config.exchange_durable);
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: `AMQP_URL=amqp://localhost:5672 cargo test -- --ignored messaging::publisher`
#[cfg(test)]
mod integration_tests {
    use super::*;
    use lapin::options::{QueueBindOptions, QueueDeclareOptions};

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ"]
    async fn publish_to_bound_queue_succeeds() {
        let exchange = format!("test-exchange-{}", uuid::Uuid::new_v4());
        let publisher = AmqpPublisher::new(PublisherConfig::new(amqp_url(), &exchange)).await.unwrap();

        let conn = deadpool_lapin::Manager::new(amqp_url(), Default::default());
        let pool = Pool::builder(conn).max_size(1).build().unwrap();
        let channel = pool.get().await.unwrap().create_channel().await.unwrap();
        let queue = format!("test-queue-{}", uuid::Uuid::new_v4());
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel.queue_bind(&queue, &exchange, "thing.*", QueueBindOptions::default(), FieldTable::default()).await.unwrap();

        publisher
            .publish("thing.happened", b"{}", FieldTable::default(), None, None, true)
            .await
            .expect("routed publish must succeed");
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ"]
    async fn mandatory_publish_with_no_bound_queue_is_undeliverable() {
        let exchange = format!("test-exchange-{}", uuid::Uuid::new_v4());
        let publisher = AmqpPublisher::new(PublisherConfig::new(amqp_url(), &exchange)).await.unwrap();

        let result = publisher.publish("nobody.listening", b"{}", FieldTable::default(), None, None, true).await;
        assert!(matches!(result, Err(MessagingError::UndeliverableMessage)));
    }
}
