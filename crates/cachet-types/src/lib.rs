//! Shared types, key derivation and error hierarchy for Cachet.

pub mod error;
pub mod keys;
pub mod state;

pub use error::{CachetError, CodecError, ConfigError, StoreError};
pub use keys::{KeyNamespacer, SessionKeys, validate_application_name};
pub use state::{CachedResponse, CachedVary, OutputCacheEntry, SessionState, SessionValue};
