//! AMQP RPC subsystem (§4.5): request routing, the `Rpc` entrypoint, reply
//! serialization, correlation-based reply matching, and the client-side
//! method proxy.

pub mod consumer;
pub mod entrypoint;
pub mod proxy;
pub mod reply_listener;
pub mod responder;

pub use consumer::{RpcConsumer, RpcProvider};
pub use entrypoint::Rpc;
pub use proxy::MethodProxy;
pub use reply_listener::ReplyListener;
pub use responder::Responder;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SerializedException;

/// Default RPC exchange name, overridable via the `RPC_EXCHANGE` config key (§6).
pub const DEFAULT_RPC_EXCHANGE: &str = "nameko-rpc";

/// Reply-queue TTL in milliseconds (§3 — "300 000 ms so abandoned queues
/// disappear").
pub const REPLY_QUEUE_EXPIRES_MS: u32 = 300_000;

/// Wire body of an RPC request (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: HashMap<String, Value>,
}

/// Wire body of an RPC reply (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyBody {
    pub result: Option<Value>,
    pub error: Option<SerializedException>,
}

pub fn request_queue_name(service_name: &str) -> String {
    format!("rpc-{service_name}")
}

pub fn request_routing_key(service_name: &str, method_name: &str) -> String {
    format!("{service_name}.{method_name}")
}

pub fn request_binding_key(service_name: &str) -> String {
    format!("{service_name}.*")
}

pub fn reply_queue_name(service_name: &str, instance_id: &uuid::Uuid) -> String {
    format!("rpc.reply-{service_name}-{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_and_routing_key_naming() {
        assert_eq!(request_queue_name("math"), "rpc-math");
        assert_eq!(request_routing_key("math", "add"), "math.add");
        assert_eq!(request_binding_key("math"), "math.*");
    }
}
