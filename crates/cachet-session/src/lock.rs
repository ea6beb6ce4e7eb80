//! Exclusive write-lock protocol over the remote store.
//!
//! A session is Unlocked, locked by us, or locked by someone else. Only the
//! holder of the token stored under the lock key may write or delete the
//! session, and releasing re-applies the session TTL to data and meta.

use std::time::Duration;

use cachet_client::{LockScript, RetryingClient};
use cachet_types::{ConfigError, SessionKeys, StoreError};
use chrono::Utc;

use crate::token::LockToken;

/// How lock operations reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// One server-side script per operation. Atomic.
    Scripted,
    /// Plain GET/SET/SETNX/EXPIRE/DEL. Release, remove and update check the
    /// owner and then act in separate commands, so another writer can slip
    /// in between.
    Sequential,
}

/// Result of [`LockCoordinator::try_acquire_write_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// The lock was free and now holds the candidate token.
    pub acquired: bool,
    /// Token stored under the lock key after the call.
    pub holder: Option<LockToken>,
    /// Session payload. Only returned to the lock holder.
    pub data: Option<Vec<u8>>,
    pub session_timeout: Option<u32>,
}

/// Result of [`LockCoordinator::try_peek_without_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekOutcome {
    pub is_free: bool,
    pub holder: Option<LockToken>,
    /// Session payload. Only returned while nobody holds the lock.
    pub data: Option<Vec<u8>>,
    pub session_timeout: Option<u32>,
}

/// Runs the lock protocol for one application's sessions.
#[derive(Clone)]
pub struct LockCoordinator {
    client: RetryingClient,
    strategy: LockStrategy,
}

impl LockCoordinator {
    /// Scripted coordinator.
    pub fn scripted(client: RetryingClient) -> Self {
        Self {
            client,
            strategy: LockStrategy::Scripted,
        }
    }

    /// Coordinator with an explicit strategy. `Sequential` requires
    /// `allow_non_atomic`.
    pub fn new(
        client: RetryingClient,
        strategy: LockStrategy,
        allow_non_atomic: bool,
    ) -> Result<Self, ConfigError> {
        if strategy == LockStrategy::Sequential {
            if !allow_non_atomic {
                return Err(ConfigError::InvalidValue {
                    key: "store.allow_non_atomic_locks".into(),
                    message: "the sequential lock strategy is not atomic and must be enabled explicitly".into(),
                });
            }
            tracing::warn!(
                "Using non-atomic sequential session locks on {}; concurrent writers can interleave on release, remove and update",
                client.connection().describe()
            );
        }
        Ok(Self { client, strategy })
    }

    /// Pick the strategy the connected store supports.
    ///
    /// Scripted when the store runs scripts. Otherwise sequential if allowed,
    /// else a configuration error.
    pub async fn negotiate(
        client: RetryingClient,
        allow_non_atomic: bool,
    ) -> Result<Self, cachet_types::CachetError> {
        if client.supports_scripting().await? {
            return Ok(Self::scripted(client));
        }
        if !allow_non_atomic {
            return Err(ConfigError::InvalidValue {
                key: "store.allow_non_atomic_locks".into(),
                message: format!(
                    "{} does not support scripting; enable allow_non_atomic_locks to use sequential locks",
                    client.connection().describe()
                ),
            }
            .into());
        }
        Ok(Self::new(client, LockStrategy::Sequential, true)?)
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Take the write lock if it is free.
    ///
    /// Data is returned only if the lock ends up holding `candidate`. When a
    /// session timeout is stored, data and meta get their TTL refreshed.
    pub async fn try_acquire_write_lock(
        &self,
        keys: &SessionKeys,
        candidate: &LockToken,
        lock_timeout_secs: u32,
    ) -> Result<AcquireOutcome, StoreError> {
        let lock_timeout_secs = clamp_timeout(lock_timeout_secs);
        let (holder, data, session_timeout, newly_locked) = match self.strategy {
            LockStrategy::Scripted => {
                let script = LockScript::Acquire {
                    token: candidate.as_str().to_string(),
                    lock_ttl_secs: lock_timeout_secs,
                };
                let snapshot = self.client.eval(keys, &script).await?.into_snapshot()?;
                (
                    snapshot.lock_token,
                    snapshot.data,
                    snapshot.session_timeout,
                    snapshot.newly_locked,
                )
            }
            LockStrategy::Sequential => {
                let newly_locked = self
                    .client
                    .set_if_absent(
                        &keys.lock,
                        candidate.as_str().as_bytes(),
                        Some(secs(lock_timeout_secs)),
                    )
                    .await?;
                let holder = self.read_holder(keys).await?;
                let data = if holder.as_deref() == Some(candidate.as_str()) {
                    self.client.get(&keys.data).await?
                } else {
                    None
                };
                let session_timeout = self.refresh_session_ttl(keys).await?;
                (holder, data, session_timeout, newly_locked)
            }
        };

        let acquired = newly_locked && holder.as_deref() == Some(candidate.as_str());
        tracing::debug!(
            "Acquire {}: acquired={acquired} holder={:?}",
            keys.lock,
            holder
        );
        Ok(AcquireOutcome {
            acquired,
            holder: holder.map(LockToken::from_stored),
            data,
            session_timeout,
        })
    }

    /// Read the session without taking the lock. Lock state is untouched.
    pub async fn try_peek_without_lock(&self, keys: &SessionKeys) -> Result<PeekOutcome, StoreError> {
        let (holder, data, session_timeout) = match self.strategy {
            LockStrategy::Scripted => {
                let snapshot = self
                    .client
                    .eval(keys, &LockScript::Peek)
                    .await?
                    .into_snapshot()?;
                (snapshot.lock_token, snapshot.data, snapshot.session_timeout)
            }
            LockStrategy::Sequential => {
                let holder = self.read_holder(keys).await?;
                let data = if holder.is_none() {
                    self.client.get(&keys.data).await?
                } else {
                    None
                };
                let session_timeout = self.refresh_session_ttl(keys).await?;
                (holder, data, session_timeout)
            }
        };

        Ok(PeekOutcome {
            is_free: holder.is_none(),
            holder: holder.map(LockToken::from_stored),
            data,
            session_timeout,
        })
    }

    /// Drop the lock if `token` holds it and re-apply the session TTL
    /// (stored timeout, else `fallback_timeout_secs`). Returns whether the
    /// lock was ours.
    pub async fn release_if_owned(
        &self,
        keys: &SessionKeys,
        token: &LockToken,
        fallback_timeout_secs: u32,
    ) -> Result<bool, StoreError> {
        let fallback_timeout_secs = clamp_timeout(fallback_timeout_secs);
        match self.strategy {
            LockStrategy::Scripted => {
                let script = LockScript::ReleaseIfOwned {
                    token: token.as_str().to_string(),
                    fallback_timeout_secs,
                };
                self.client.eval(keys, &script).await?.into_applied()
            }
            LockStrategy::Sequential => {
                if !self.is_owned_by(keys, token).await? {
                    return Ok(false);
                }
                self.client.delete(&keys.lock).await?;
                let timeout = self
                    .read_timeout(keys)
                    .await?
                    .unwrap_or(fallback_timeout_secs);
                self.expire_record(keys, timeout).await?;
                Ok(true)
            }
        }
    }

    /// Delete lock, data and meta if `token` holds the lock.
    pub async fn release_and_delete(
        &self,
        keys: &SessionKeys,
        token: &LockToken,
    ) -> Result<bool, StoreError> {
        match self.strategy {
            LockStrategy::Scripted => {
                let script = LockScript::RemoveIfOwned {
                    token: token.as_str().to_string(),
                };
                self.client.eval(keys, &script).await?.into_applied()
            }
            LockStrategy::Sequential => {
                if !self.is_owned_by(keys, token).await? {
                    return Ok(false);
                }
                self.client.delete(&keys.data).await?;
                self.client.delete(&keys.meta).await?;
                self.client.delete(&keys.lock).await?;
                Ok(true)
            }
        }
    }

    /// Write `data` with a fresh TTL and drop the lock if `token` holds it.
    pub async fn update_and_release(
        &self,
        keys: &SessionKeys,
        token: &LockToken,
        data: &[u8],
        session_timeout_secs: u32,
    ) -> Result<bool, StoreError> {
        let session_timeout_secs = clamp_timeout(session_timeout_secs);
        match self.strategy {
            LockStrategy::Scripted => {
                let script = LockScript::UpdateAndRelease {
                    token: token.as_str().to_string(),
                    data: data.to_vec(),
                    timeout_secs: session_timeout_secs,
                };
                self.client.eval(keys, &script).await?.into_applied()
            }
            LockStrategy::Sequential => {
                if !self.is_owned_by(keys, token).await? {
                    return Ok(false);
                }
                self.write_unlocked(keys, data, session_timeout_secs).await?;
                self.client.delete(&keys.lock).await?;
                Ok(true)
            }
        }
    }

    /// Wall-clock time since `token` was minted.
    pub fn lock_age(&self, token: &LockToken) -> Duration {
        token.age(Utc::now())
    }

    /// Make `timeout_secs` the session's idle timeout: meta records it and
    /// data and meta expire that long from now. Later reads keep applying it.
    /// Returns `false` if no session data exists.
    pub async fn update_idle_expiry(
        &self,
        keys: &SessionKeys,
        timeout_secs: u32,
    ) -> Result<bool, StoreError> {
        let timeout_secs = clamp_timeout(timeout_secs);
        match self.strategy {
            LockStrategy::Scripted => {
                let script = LockScript::ResetTimeout { timeout_secs };
                self.client.eval(keys, &script).await?.into_applied()
            }
            LockStrategy::Sequential => {
                let ttl = secs(timeout_secs);
                if !self.client.expire(&keys.data, ttl).await? {
                    return Ok(false);
                }
                self.client
                    .set_with_ttl(&keys.meta, timeout_secs.to_string().as_bytes(), ttl)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Write data and meta without looking at the lock.
    pub async fn write_unlocked(
        &self,
        keys: &SessionKeys,
        data: &[u8],
        timeout_secs: u32,
    ) -> Result<(), StoreError> {
        let timeout_secs = clamp_timeout(timeout_secs);
        let ttl = secs(timeout_secs);
        self.client.set_with_ttl(&keys.data, data, ttl).await?;
        self.client
            .set_with_ttl(&keys.meta, timeout_secs.to_string().as_bytes(), ttl)
            .await
    }

    async fn read_holder(&self, keys: &SessionKeys) -> Result<Option<String>, StoreError> {
        Ok(self
            .client
            .get(&keys.lock)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    async fn is_owned_by(&self, keys: &SessionKeys, token: &LockToken) -> Result<bool, StoreError> {
        Ok(self.read_holder(keys).await?.as_deref() == Some(token.as_str()))
    }

    async fn read_timeout(&self, keys: &SessionKeys) -> Result<Option<u32>, StoreError> {
        Ok(self
            .client
            .get(&keys.meta)
            .await?
            .and_then(|raw| parse_timeout(&raw)))
    }

    async fn refresh_session_ttl(&self, keys: &SessionKeys) -> Result<Option<u32>, StoreError> {
        let timeout = self.read_timeout(keys).await?;
        if let Some(timeout) = timeout {
            self.expire_record(keys, timeout).await?;
        }
        Ok(timeout)
    }

    async fn expire_record(&self, keys: &SessionKeys, timeout_secs: u32) -> Result<(), StoreError> {
        let ttl = secs(timeout_secs);
        self.client.expire(&keys.data, ttl).await?;
        self.client.expire(&keys.meta, ttl).await?;
        Ok(())
    }
}

/// Timeouts are at least one second. Redis rejects `EX 0`.
fn clamp_timeout(secs: u32) -> u32 {
    secs.max(1)
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(u64::from(n))
}

fn parse_timeout(raw: &[u8]) -> Option<u32> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
