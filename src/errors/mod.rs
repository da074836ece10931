//! Error taxonomy (one `thiserror` enum per subsystem, mirroring the way
//! the rest of this crate groups concerns by module rather than reaching
//! for one crate-wide error type).

pub mod exception;

pub use exception::{deserialize, serialize, RegisteredException, RemoteError, SerializedException};

use thiserror::Error;

/// Raised at container construction/startup when config is missing or
/// malformed, or names a serializer nothing registered.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("service class must define a non-empty name")]
    MissingServiceName,
    #[error("please register a serializer for \"{0}\" format")]
    UnknownSerializer(String),
    #[error("accept list must be a superset of the default serializer \"{0}\"")]
    AcceptDoesNotCoverSerializer(String),
    #[error("missing required configuration key `{0}`")]
    MissingKey(String),
    #[error("{0}")]
    Other(String),
}

/// Raised by [`crate::container::ServiceContainer::spawn_worker`] when the
/// container has already started shutting down. Entrypoints translate this
/// into a requeue of the triggering message.
#[derive(Debug, Error, Clone, Copy)]
#[error("container is being killed")]
pub struct ContainerBeingKilled;

/// Errors surfaced by the AMQP publisher and the shared queue consumer.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("message was not routed to any queue (NO_ROUTE)")]
    UndeliverableMessage,
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("no provider registered for queue `{0}`")]
    NoSuchProvider(String),
}

/// RPC-specific typed errors (request validation, dispatch, and the
/// caller-side translations of broker-reported conditions).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("message is missing `args` or `kwargs`")]
    MalformedRequest,
    #[error("method `{0}` not found")]
    MethodNotFound(String),
    #[error("incorrect signature: {0}")]
    IncorrectSignature(String),
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("value could not be serialized for reply: {0}")]
    UnserializableValueError(String),
    #[error("rpc call timed out")]
    RpcTimeout,
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// A reply whose `error` was set, deserialized through the exception
    /// registry (§4.5, §7, §8). Holds the boxed, downcastable error rather
    /// than a fixed [`RemoteError`] type so a registered exception type
    /// round-trips as itself instead of being flattened.
    #[error(transparent)]
    Remote(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    BeingKilled(#[from] ContainerBeingKilled),
}

/// Raised when an `EventHandler` is constructed with an incompatible
/// combination of dispatch style and delivery options (§4.6 — BROADCAST
/// with `reliable_delivery = true`).
#[derive(Debug, Error)]
#[error("event handler misconfigured: {0}")]
pub struct EventHandlerConfigurationError(pub String);
