//! Locked session state over a remote store for Cachet.

pub mod codec;
pub mod lock;
pub mod store;
pub mod token;

pub use codec::{CodecRegistry, JsonCodec, SessionCodec, TlvCodec, TypeAllowList};
pub use lock::{AcquireOutcome, LockCoordinator, LockStrategy, PeekOutcome};
pub use store::{ItemLookup, SessionStore, SessionTimeouts};
pub use token::{LockToken, TokenMinter};
