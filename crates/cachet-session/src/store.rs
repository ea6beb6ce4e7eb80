//! Session store facade: the operations a host framework's session provider
//! calls, expressed over keys, locks and a codec.

use std::sync::Arc;
use std::time::Duration;

use cachet_client::{RetryPolicy, RetryingClient, SharedConnection};
use cachet_config::CachetConfig;
use cachet_types::{CachetError, KeyNamespacer, SessionState, StoreError};

use crate::codec::{CodecRegistry, SessionCodec, TypeAllowList, decode_or_warn, encode_or_warn};
use crate::lock::LockCoordinator;
use crate::token::{LockToken, TokenMinter};

/// Lock and session lifetimes applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// TTL of a write lock. Bounds how long a crashed holder blocks others.
    pub lock_timeout_secs: u32,
    /// Idle expiry used when a record has no stored timeout.
    pub session_timeout_secs: u32,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            lock_timeout_secs: cachet_config::DEFAULT_LOCK_TIMEOUT_SECS,
            session_timeout_secs: cachet_config::DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

/// Result of reading a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemLookup {
    /// The session can be used. `state` is `None` when nothing is stored
    /// (or the stored bytes could not be decoded). `lock` is set when the
    /// read took the write lock.
    Available {
        state: Option<SessionState>,
        session_timeout: u32,
        lock: Option<LockToken>,
    },
    /// Another request holds the write lock.
    Locked { holder: LockToken, age: Duration },
}

/// Shared session state for one application.
#[derive(Clone)]
pub struct SessionStore {
    namespacer: KeyNamespacer,
    coordinator: LockCoordinator,
    codec: Arc<dyn SessionCodec>,
    minter: Arc<TokenMinter>,
    timeouts: SessionTimeouts,
}

impl SessionStore {
    pub fn new(
        namespacer: KeyNamespacer,
        coordinator: LockCoordinator,
        codec: Arc<dyn SessionCodec>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            namespacer,
            coordinator,
            codec,
            minter: Arc::new(TokenMinter::new()),
            timeouts,
        }
    }

    /// Build a store from resolved configuration using the built-in codecs.
    pub async fn connect(config: &CachetConfig) -> Result<Self, CachetError> {
        let registry = CodecRegistry::with_builtins(TypeAllowList::new(
            config.allowed_types.iter().cloned(),
        ));
        Self::connect_with_registry(config, &registry).await
    }

    /// Like [`SessionStore::connect`], resolving the codec from `registry`.
    pub async fn connect_with_registry(
        config: &CachetConfig,
        registry: &CodecRegistry,
    ) -> Result<Self, CachetError> {
        let namespacer = KeyNamespacer::new(config.application_name.clone())?;
        let codec = registry.resolve(&config.codec)?;
        let connection = SharedConnection::for_endpoints(&config.endpoints)?;
        let client = RetryingClient::new(connection)
            .with_retry_policy(RetryPolicy::with_timeout(config.retry_timeout));
        let coordinator =
            LockCoordinator::negotiate(client, config.allow_non_atomic_locks).await?;
        tracing::debug!(
            "Session store for '{}' using codec {} and {:?} locks",
            namespacer.application_name(),
            codec.name(),
            coordinator.strategy()
        );
        Ok(Self::new(
            namespacer,
            coordinator,
            codec,
            SessionTimeouts {
                lock_timeout_secs: config.lock_timeout_secs,
                session_timeout_secs: config.session_timeout_secs,
            },
        ))
    }

    pub fn namespacer(&self) -> &KeyNamespacer {
        &self.namespacer
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn codec(&self) -> &dyn SessionCodec {
        self.codec.as_ref()
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    /// Read a session without locking it.
    pub async fn get_item(&self, session_id: &str) -> Result<ItemLookup, StoreError> {
        let keys = self.namespacer.keys(session_id);
        let peek = self.coordinator.try_peek_without_lock(&keys).await?;
        if let Some(holder) = peek.holder {
            let age = self.coordinator.lock_age(&holder);
            return Ok(ItemLookup::Locked { holder, age });
        }
        Ok(ItemLookup::Available {
            state: self.decode(peek.data.as_deref()),
            session_timeout: peek
                .session_timeout
                .unwrap_or(self.timeouts.session_timeout_secs),
            lock: None,
        })
    }

    /// Read a session and take its write lock.
    ///
    /// On success the returned token must be handed back to
    /// [`SessionStore::set_and_release_item`],
    /// [`SessionStore::release_item_exclusive`] or
    /// [`SessionStore::remove_item`].
    pub async fn get_item_exclusive(&self, session_id: &str) -> Result<ItemLookup, StoreError> {
        let keys = self.namespacer.keys(session_id);
        let candidate = self.minter.mint_now();
        let outcome = self
            .coordinator
            .try_acquire_write_lock(&keys, &candidate, self.timeouts.lock_timeout_secs)
            .await?;

        if outcome.acquired {
            return Ok(ItemLookup::Available {
                state: self.decode(outcome.data.as_deref()),
                session_timeout: outcome
                    .session_timeout
                    .unwrap_or(self.timeouts.session_timeout_secs),
                lock: Some(candidate),
            });
        }
        match outcome.holder {
            Some(holder) => {
                let age = self.coordinator.lock_age(&holder);
                Ok(ItemLookup::Locked { holder, age })
            }
            None => Err(StoreError::Protocol(format!(
                "lock on '{session_id}' was neither taken nor held"
            ))),
        }
    }

    /// Store `state` and release the lock.
    ///
    /// Here and elsewhere in the store, a timeout of zero is raised to one
    /// second.
    ///
    /// With `lock` set, the write only happens if that token still holds
    /// the lock; returns `false` if it was lost. Without a lock the state is
    /// written as a new item.
    pub async fn set_and_release_item(
        &self,
        session_id: &str,
        state: &SessionState,
        lock: Option<&LockToken>,
        timeout_secs: u32,
    ) -> Result<bool, StoreError> {
        let keys = self.namespacer.keys(session_id);
        let data = encode_or_warn(self.codec.as_ref(), Some(state));
        match lock {
            Some(token) => {
                let applied = self
                    .coordinator
                    .update_and_release(&keys, token, &data, timeout_secs)
                    .await?;
                if !applied {
                    tracing::warn!(
                        "Write to session '{session_id}' dropped: lock {token} is no longer held"
                    );
                }
                Ok(applied)
            }
            None => {
                self.coordinator
                    .write_unlocked(&keys, &data, timeout_secs)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Release the write lock without writing.
    pub async fn release_item_exclusive(
        &self,
        session_id: &str,
        lock: &LockToken,
    ) -> Result<bool, StoreError> {
        let keys = self.namespacer.keys(session_id);
        self.coordinator
            .release_if_owned(&keys, lock, self.timeouts.session_timeout_secs)
            .await
    }

    /// Delete a session. Only the lock holder may do this.
    pub async fn remove_item(&self, session_id: &str, lock: &LockToken) -> Result<bool, StoreError> {
        let keys = self.namespacer.keys(session_id);
        self.coordinator.release_and_delete(&keys, lock).await
    }

    /// Change a session's idle timeout and restart its expiry. Returns
    /// `false` if the session does not exist.
    pub async fn reset_item_timeout(
        &self,
        session_id: &str,
        timeout_secs: u32,
    ) -> Result<bool, StoreError> {
        let keys = self.namespacer.keys(session_id);
        self.coordinator.update_idle_expiry(&keys, timeout_secs).await
    }

    /// Store an empty, unlocked session.
    pub async fn create_uninitialized_item(
        &self,
        session_id: &str,
        timeout_secs: u32,
    ) -> Result<(), StoreError> {
        let keys = self.namespacer.keys(session_id);
        let data = encode_or_warn(self.codec.as_ref(), Some(&SessionState::new()));
        self.coordinator
            .write_unlocked(&keys, &data, timeout_secs)
            .await
    }

    /// Release a lock whose holder has kept it longer than `max_age`.
    ///
    /// Returns the reclaimed token, or `None` if the session is unlocked,
    /// the holder is younger than `max_age`, or the lock changed hands
    /// before the release ran.
    pub async fn release_abandoned_lock(
        &self,
        session_id: &str,
        max_age: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        let keys = self.namespacer.keys(session_id);
        let peek = self.coordinator.try_peek_without_lock(&keys).await?;
        let Some(holder) = peek.holder else {
            return Ok(None);
        };
        let age = self.coordinator.lock_age(&holder);
        if age <= max_age {
            return Ok(None);
        }
        let released = self
            .coordinator
            .release_if_owned(&keys, &holder, self.timeouts.session_timeout_secs)
            .await?;
        if released {
            tracing::info!("Released abandoned lock {holder} on session '{session_id}'");
            Ok(Some(holder))
        } else {
            Ok(None)
        }
    }

    fn decode(&self, data: Option<&[u8]>) -> Option<SessionState> {
        data.and_then(|bytes| decode_or_warn(self.codec.as_ref(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TlvCodec;
    use cachet_client::MemoryConnector;

    fn memory_store() -> SessionStore {
        let client = RetryingClient::new(SharedConnection::new(Arc::new(MemoryConnector::new())));
        SessionStore::new(
            KeyNamespacer::new("app").unwrap(),
            LockCoordinator::scripted(client),
            Arc::new(TlvCodec::default()),
            SessionTimeouts::default(),
        )
    }

    #[test]
    fn default_timeouts() {
        let timeouts = SessionTimeouts::default();
        assert_eq!(timeouts.lock_timeout_secs, 110);
        assert_eq!(timeouts.session_timeout_secs, 1200);
    }

    #[tokio::test]
    async fn unknown_session_is_available_and_empty() {
        let store = memory_store();
        assert_eq!(
            store.get_item("nobody").await.unwrap(),
            ItemLookup::Available {
                state: None,
                session_timeout: 1200,
                lock: None,
            }
        );
    }

    #[tokio::test]
    async fn exclusive_reads_mint_distinct_tokens() {
        let store = memory_store();
        let first = match store.get_item_exclusive("a").await.unwrap() {
            ItemLookup::Available { lock: Some(lock), .. } => lock,
            other => panic!("expected lock, got {other:?}"),
        };
        let second = match store.get_item_exclusive("b").await.unwrap() {
            ItemLookup::Available { lock: Some(lock), .. } => lock,
            other => panic!("expected lock, got {other:?}"),
        };
        assert_ne!(first, second);
    }
}
