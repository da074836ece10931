//! AMQP transport primitives shared by the RPC and event subsystems: the
//! publisher (§4.1), the shared queue consumer (§4.4), and the header codec
//! that carries context data (notably the call-id stack) across the wire
//! (§6, supplement B.5).

pub mod consumer;
pub mod publisher;

pub use consumer::{ExchangeBinding, QueueConsumer, QueueProvider};
pub use publisher::{AmqpPublisher, PublisherConfig};

use std::collections::HashMap;

/// Builds a lazily-connecting pool against `amqp_uri`. Building the pool is
/// synchronous (no connection attempt happens until first use), which lets
/// shared extensions construct one from inside
/// [`crate::container::ServiceContainer::shared_extension`]'s synchronous
/// `init` closure.
pub fn build_pool(amqp_uri: &str) -> deadpool_lapin::Pool {
    let manager = deadpool_lapin::Manager::new(amqp_uri.to_string(), deadpool_lapin::ConnectionProperties::default());
    deadpool_lapin::Pool::builder(manager).max_size(10).build().expect("pool configuration is always valid")
}

/// Encodes/decodes a context-data map into AMQP header keys under a
/// configurable prefix (default `nameko.`, §6). The source calls this
/// `HeaderEncoder`/`HeaderDecoder`; combined into one trait here since every
/// implementor in this crate needs both directions.
pub trait HeaderCodec: Send + Sync {
    fn prefix(&self) -> &str;

    fn encode(&self, data: &HashMap<String, String>) -> HashMap<String, String> {
        data.iter().map(|(k, v)| (format!("{}{}", self.prefix(), k), v.clone())).collect()
    }

    fn decode(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(self.prefix()).map(|stripped| (stripped.to_string(), v.clone())))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DefaultHeaderCodec {
    pub prefix: String,
}

impl Default for DefaultHeaderCodec {
    fn default() -> Self {
        Self { prefix: "nameko.".to_string() }
    }
}

impl HeaderCodec for DefaultHeaderCodec {
    fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Header key carrying the call-id stack, e.g. `nameko.call_id_stack`.
pub fn call_id_stack_header(codec: &dyn HeaderCodec) -> String {
    format!("{}call_id_stack", codec.prefix())
}

pub fn encode_call_id_stack(codec: &dyn HeaderCodec, stack: &[String]) -> (String, String) {
    (
        call_id_stack_header(codec),
        serde_json::to_string(stack).expect("Vec<String> always serializes"),
    )
}

pub fn decode_call_id_stack(codec: &dyn HeaderCodec, headers: &HashMap<String, String>) -> Vec<String> {
    headers
        .get(&call_id_stack_header(codec))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Flattens an AMQP properties' header table into a plain string map.
/// Non-string header values (tables, arrays, numbers) are dropped rather
/// than lossily stringified, matching the set of values this crate ever
/// writes into headers (see [`HeaderCodec::encode`]).
pub fn decode_amqp_headers(properties: &lapin::BasicProperties) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner().iter() {
            let value = match value {
                lapin::types::AMQPValue::LongString(s) => Some(s.to_string()),
                lapin::types::AMQPValue::ShortString(s) => Some(s.to_string()),
                _ => None,
            };
            if let Some(value) = value {
                headers.insert(key.as_str().to_string(), value);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_inverse_of_encode_for_ascii_keys_without_dots() {
        let codec = DefaultHeaderCodec::default();
        let mut data = HashMap::new();
        data.insert("language".to_string(), "en".to_string());
        data.insert("userAgent".to_string(), "curl".to_string());

        let encoded = codec.encode(&data);
        for key in encoded.keys() {
            assert!(key.starts_with("nameko."));
        }
        let decoded = codec.decode(&encoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_ignores_headers_outside_the_prefix() {
        let codec = DefaultHeaderCodec::default();
        let mut headers = HashMap::new();
        headers.insert("x-custom".to_string(), "value".to_string());
        assert!(codec.decode(&headers).is_empty());
    }

    #[test]
    fn call_id_stack_round_trips() {
        let codec = DefaultHeaderCodec::default();
        let stack = vec!["math.add.1".to_string(), "math.add.2".to_string()];
        let (key, value) = encode_call_id_stack(&codec, &stack);
        let mut headers = HashMap::new();
        headers.insert(key, value);
        assert_eq!(decode_call_id_stack(&codec, &headers), stack);
    }
}
