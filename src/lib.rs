//! nameko-rs - microservice framework core
//!
//! A Rust implementation of the core of the `nameko` microservice framework:
//! a service container that hosts dependency-injected extensions and
//! entrypoints, AMQP RPC with typed error propagation, a topic-based event
//! bus, a wall-clock-aligned periodic timer, and the runner that hosts one
//! or more containers in a single process.

pub mod concurrency;
pub mod config;
pub mod container;
pub mod errors;
pub mod events;
pub mod extensions;
pub mod messaging;
pub mod redaction;
pub mod rpc;
pub mod runner;
pub mod standalone;
pub mod timer;

/// Re-exported so [`errors::exception::register_exception!`] can refer to
/// `$crate::inventory` from outside this crate.
pub use inventory;
