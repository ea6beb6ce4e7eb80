//! Backend abstraction: a connected transport and the factory that opens one.

use async_trait::async_trait;
use cachet_types::{SessionKeys, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// One server-side script of the session lock protocol.
///
/// Every script runs against the three keys of one session, in the order
/// lock, data, meta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScript {
    /// Take the write lock if free; return data if the caller holds it.
    Acquire { token: String, lock_ttl_secs: u32 },
    /// Report the lock holder; return data only when unlocked.
    Peek,
    /// Drop the lock if `token` holds it and re-apply the session TTL.
    ReleaseIfOwned {
        token: String,
        fallback_timeout_secs: u32,
    },
    /// Delete lock, data and meta if `token` holds the lock.
    RemoveIfOwned { token: String },
    /// Write new data with a fresh TTL and drop the lock if `token` holds it.
    UpdateAndRelease {
        token: String,
        data: Vec<u8>,
        timeout_secs: u32,
    },
    /// Store a new session timeout in meta and re-apply it to data and meta.
    /// Does nothing if there is no data.
    ResetTimeout { timeout_secs: u32 },
}

impl LockScript {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            LockScript::Acquire { .. } => "acquire",
            LockScript::Peek => "peek",
            LockScript::ReleaseIfOwned { .. } => "release",
            LockScript::RemoveIfOwned { .. } => "remove",
            LockScript::UpdateAndRelease { .. } => "update-and-release",
            LockScript::ResetTimeout { .. } => "reset-timeout",
        }
    }
}

/// Reply of the acquire and peek scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Token currently stored under the lock key.
    pub lock_token: Option<String>,
    /// Session payload, present only when the caller may read it.
    pub data: Option<Vec<u8>>,
    /// Session timeout from the meta key, if one is stored.
    pub session_timeout: Option<u32>,
    /// Whether this call created the lock.
    pub newly_locked: bool,
}

/// Reply of a [`LockScript`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Snapshot(LockSnapshot),
    /// Whether the ownership check passed and the mutation ran.
    Applied(bool),
}

impl ScriptOutcome {
    pub fn into_snapshot(self) -> Result<LockSnapshot, StoreError> {
        match self {
            ScriptOutcome::Snapshot(snapshot) => Ok(snapshot),
            ScriptOutcome::Applied(_) => Err(StoreError::Protocol(
                "expected a lock snapshot, got a mutation reply".into(),
            )),
        }
    }

    pub fn into_applied(self) -> Result<bool, StoreError> {
        match self {
            ScriptOutcome::Applied(applied) => Ok(applied),
            ScriptOutcome::Snapshot(_) => Err(StoreError::Protocol(
                "expected a mutation reply, got a lock snapshot".into(),
            )),
        }
    }
}

/// A live connection to the remote store.
///
/// After [`Transport::close`] every operation must fail with
/// [`StoreError::StaleHandle`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Store only if the key is absent. Returns whether the value was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns `false` if the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Run a lock script atomically on the server.
    async fn eval(&self, keys: &SessionKeys, script: &LockScript)
    -> Result<ScriptOutcome, StoreError>;

    /// Whether [`Transport::eval`] is available.
    fn supports_scripting(&self) -> bool {
        true
    }

    /// Mark the handle closed. Called when a reconnect replaces it.
    async fn close(&self) {}
}

/// Opens transports. Held by the shared connection for reconnects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, StoreError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}
