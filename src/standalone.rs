//! Standalone RPC clients (supplement B.2), grounded in
//! `nameko.standalone.rpc.ServiceRpcProxy`/`ClusterRpcProxy`: a way to call
//! into the cluster from code that doesn't itself host a
//! [`crate::container::ServiceContainer`] — a CLI, a test harness, a one-off
//! script. Built from the same [`crate::rpc::MethodProxy`] /
//! [`crate::rpc::ReplyListener`] the container-hosted `Rpc` entrypoint's
//! caller side would use, rather than a separate polling implementation
//! (§9 — this crate's single task-runtime-backed queue consumer already
//! covers the role the source splits out into `PollingQueueConsumer`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::config::Config;
use crate::container::ManagedTaskSpawner;
use crate::errors::{MessagingError, RpcError};
use crate::extensions::Extension;
use crate::messaging::{build_pool, AmqpPublisher, DefaultHeaderCodec, HeaderCodec, PublisherConfig, QueueConsumer};
use crate::rpc::{MethodProxy, ReplyListener};

struct TokioSpawner;

impl ManagedTaskSpawner for TokioSpawner {
    fn spawn_managed(&self, fut: BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>) {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(error = %e, "standalone rpc client background task failed");
            }
        });
    }
}

/// Shared machinery behind both standalone client flavors: one reply queue,
/// one publisher, an optional per-call timeout.
struct RpcConnection {
    publisher: Arc<AmqpPublisher>,
    reply_listener: Arc<ReplyListener>,
    queue_consumer: QueueConsumer,
    timeout: Option<Duration>,
    extra_headers: HashMap<String, String>,
}

impl RpcConnection {
    async fn connect(config: &Config, context_data: HashMap<String, String>, timeout: Option<Duration>) -> Result<Self, MessagingError> {
        let pool = build_pool(&config.amqp_uri);
        let queue_consumer = QueueConsumer::new(pool, 10, Arc::new(TokioSpawner));
        let reply_listener = ReplyListener::new("standalone_rpc_proxy", config.rpc_exchange.clone(), queue_consumer.clone());

        reply_listener.setup().await.map_err(|e| MessagingError::Connection(e.to_string()))?;
        queue_consumer.start().await.map_err(|e| MessagingError::Connection(e.to_string()))?;
        queue_consumer.wait_ready().await;

        let publisher = Arc::new(AmqpPublisher::new(PublisherConfig::new(config.amqp_uri.clone(), config.rpc_exchange.clone())).await?);
        let header_codec = DefaultHeaderCodec::default();
        let extra_headers = header_codec.encode(&context_data);

        Ok(Self { publisher, reply_listener, queue_consumer, timeout, extra_headers })
    }

    fn proxy(&self, service_name: &str, method_name: &str) -> MethodProxy {
        MethodProxy::new(
            service_name.to_string(),
            method_name.to_string(),
            self.publisher.clone(),
            self.reply_listener.clone(),
            self.extra_headers.clone(),
        )
    }

    /// Calls `{service_name}.{method_name}`, applying the configured
    /// per-call socket timeout (§7's last row — `RpcTimeout`, the one timeout
    /// this core implements, scoped to the standalone caller).
    async fn call(&self, service_name: &str, method_name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Result<Value, RpcError> {
        let reply = self.proxy(service_name, method_name).call_async(args, kwargs).await?;
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply.result()).await.map_err(|_| RpcError::RpcTimeout)?,
            None => reply.result().await,
        }
    }

    async fn close(&self) {
        self.reply_listener.stop().await;
        self.queue_consumer.stop().await;
    }
}

/// A single-service RPC proxy usable from outside any container
/// (§9, supplement B.2 — `ServiceRpcProxy`).
pub struct StandaloneRpcClient {
    conn: RpcConnection,
    service_name: String,
}

impl StandaloneRpcClient {
    pub async fn connect(
        service_name: impl Into<String>,
        config: &Config,
        context_data: HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Self, MessagingError> {
        Ok(Self {
            conn: RpcConnection::connect(config, context_data, timeout).await?,
            service_name: service_name.into(),
        })
    }

    pub async fn call(&self, method_name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Result<Value, RpcError> {
        self.conn.call(&self.service_name, method_name, args, kwargs).await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }
}

/// A multi-service RPC proxy sharing one reply queue across every call
/// (§9, supplement B.2 — `ClusterRpcProxy`: "a single reply queue for all
/// services' calls, rather than one reply queue per service proxy").
pub struct ClusterRpcClient {
    conn: RpcConnection,
}

impl ClusterRpcClient {
    pub async fn connect(config: &Config, context_data: HashMap<String, String>, timeout: Option<Duration>) -> Result<Self, MessagingError> {
        Ok(Self { conn: RpcConnection::connect(config, context_data, timeout).await? })
    }

    pub async fn call(&self, service_name: &str, method_name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Result<Value, RpcError> {
        self.conn.call(service_name, method_name, args, kwargs).await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires RabbitMQ"]
    async fn standalone_client_can_be_constructed_against_a_live_broker() {
        let config = Config::default();
        let client = StandaloneRpcClient::connect("math", &config, HashMap::new(), Some(Duration::from_secs(5))).await.unwrap();
        client.close().await;
    }
}
