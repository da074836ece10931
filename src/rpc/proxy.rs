//! `MethodProxy` (§4.5): the client-side handle for one `{service}.{method}`
//! RPC call, built on top of a shared [`ReplyListener`] and an
//! [`AmqpPublisher`]. Grounded in `nameko.rpc.MethodProxy`/`RpcReply`, with
//! the Python `__getattr__`-built `ServiceProxy` replaced by an explicit
//! `(service_name, method_name)` pair per proxy (§9 — no runtime attribute
//! reflection in this crate).

use std::collections::HashMap;
use std::sync::Arc;

use lapin::types::{AMQPValue, FieldTable};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::errors::{deserialize, MessagingError, RpcError};
use crate::messaging::AmqpPublisher;

use super::{request_routing_key, reply_listener::ReplyListener, RequestBody, ReplyBody};

/// A pending RPC call's reply slot (§4.5 `RpcReply`).
pub struct RpcReply {
    rx: oneshot::Receiver<ReplyBody>,
}

impl RpcReply {
    /// Blocks until the reply arrives, then returns the result or raises
    /// the deserialized remote error. The oneshot channel is dropped by the
    /// `ReplyListener` only on successful delivery, so a closed channel here
    /// means the listener itself was torn down mid-call.
    pub async fn result(self) -> Result<Value, RpcError> {
        let body = self.rx.await.map_err(|_| RpcError::Messaging(MessagingError::Connection(
            "reply listener dropped before a reply arrived".to_string(),
        )))?;
        match body.error {
            Some(err) => Err(RpcError::Remote(deserialize(&err))),
            None => Ok(body.result.unwrap_or(Value::Null)),
        }
    }
}

/// One callable `{service}.{method}` RPC proxy (§4.5).
pub struct MethodProxy {
    service_name: String,
    method_name: String,
    publisher: Arc<AmqpPublisher>,
    reply_listener: Arc<ReplyListener>,
    extra_headers: HashMap<String, String>,
}

impl MethodProxy {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        publisher: Arc<AmqpPublisher>,
        reply_listener: Arc<ReplyListener>,
        extra_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            publisher,
            reply_listener,
            extra_headers,
        }
    }

    /// Publishes the request with `mandatory=true` and registers a reply
    /// slot, returning immediately without waiting for the reply (§4.5 —
    /// `call_async`). A broker-reported `NO_ROUTE` (no queue bound to
    /// `{service}.*`) is translated to [`RpcError::UnknownService`] here,
    /// synchronously, rather than leaving the caller to wait forever.
    pub async fn call_async(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Result<RpcReply, RpcError> {
        let correlation_id = Uuid::new_v4().to_string();
        let rx = self.reply_listener.register_reply(correlation_id.clone());

        let payload = serde_json::to_vec(&RequestBody { args, kwargs }).expect("RequestBody always serializes");
        let routing_key = request_routing_key(&self.service_name, &self.method_name);

        let mut headers = FieldTable::default();
        for (key, value) in &self.extra_headers {
            headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }

        let reply_to = self.reply_listener.routing_key();
        match self
            .publisher
            .publish(&routing_key, &payload, headers, Some(&reply_to), Some(&correlation_id), true)
            .await
        {
            Ok(()) => Ok(RpcReply { rx }),
            Err(MessagingError::UndeliverableMessage) => Err(RpcError::UnknownService(self.service_name.clone())),
            Err(e) => Err(RpcError::Messaging(e)),
        }
    }

    /// Publishes the request and blocks for the reply (§4.5 — "Echo RPC"
    /// scenario §8.1).
    pub async fn call(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Result<Value, RpcError> {
        self.call_async(args, kwargs).await?.result().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_proxy_targets_the_expected_routing_key() {
        assert_eq!(request_routing_key("math", "add"), "math.add");
    }
}
