//! Remote store client for Cachet: backends, shared connection and retries.

mod client;
mod connection;
mod memory;
mod redis_transport;
mod retry;
mod transport;

pub use client::RetryingClient;
pub use connection::{SharedConnection, connector_for};
pub use memory::{MemoryConnector, MemoryStore, MemoryTransport};
pub use redis_transport::{RedisConnector, RedisTransport};
pub use retry::RetryPolicy;
pub use transport::{Connector, LockScript, LockSnapshot, ScriptOutcome, Transport};
