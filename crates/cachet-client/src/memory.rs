//! In-process store with TTL expiry, for single-node development and tests.
//!
//! Lock scripts run under one mutex acquisition, so they are as atomic here
//! as the Lua versions are on Redis.

use crate::transport::{Connector, LockScript, LockSnapshot, ScriptOutcome, Transport};
use async_trait::async_trait;
use cachet_types::{SessionKeys, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Writes between sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    writes: u64,
}

/// Key space shared by every transport of one connector.
///
/// Expired keys are dropped when read, and swept from the whole map every
/// [`SWEEP_INTERVAL`] writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Entries>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live. `None` if the key is missing or has no TTL.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let entry = entries.map.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations on the locked map. Expired entries are dropped on access.
struct Keyspace<'a> {
    entries: &'a mut Entries,
    now: Instant,
}

impl Keyspace<'_> {
    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let now = self.now;
        if self.entries.map.get(key)?.is_live(now) {
            return self.entries.map.get(key).map(|e| e.value.clone());
        }
        self.entries.map.remove(key);
        None
    }

    fn get_string(&mut self, key: &str) -> Option<String> {
        self.get(key)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| self.now + ttl);
        self.entries
            .map
            .insert(key.to_string(), Entry { value, expires_at });
        self.entries.writes += 1;
        if self.entries.writes % SWEEP_INTERVAL == 0 {
            self.sweep();
        }
    }

    fn sweep(&mut self) {
        let now = self.now;
        self.entries.map.retain(|_, e| e.is_live(now));
    }

    fn set_if_absent(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        if self.get(key).is_some() {
            return false;
        }
        self.set(key, value, ttl);
        true
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if self.get(key).is_none() {
            return false;
        }
        let now = self.now;
        match self.entries.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        let existed = self.get(key).is_some();
        self.entries.map.remove(key);
        existed
    }

    /// Read the stored session timeout and re-apply it to data and meta.
    fn refresh_session_ttl(&mut self, keys: &SessionKeys) -> Option<u32> {
        let timeout = self
            .get_string(&keys.meta)
            .and_then(|raw| raw.trim().parse::<u32>().ok())?;
        let ttl = Duration::from_secs(u64::from(timeout));
        self.expire(&keys.data, ttl);
        self.expire(&keys.meta, ttl);
        Some(timeout)
    }

    fn owned_by(&mut self, keys: &SessionKeys, token: &str) -> bool {
        self.get_string(&keys.lock).as_deref() == Some(token)
    }

    fn run(&mut self, keys: &SessionKeys, script: &LockScript) -> ScriptOutcome {
        match script {
            LockScript::Acquire {
                token,
                lock_ttl_secs,
            } => {
                let ttl = Duration::from_secs(u64::from(*lock_ttl_secs));
                let newly_locked = self.set_if_absent(&keys.lock, token.as_bytes().to_vec(), Some(ttl));
                let holder = self.get_string(&keys.lock);
                let data = if holder.as_deref() == Some(token.as_str()) {
                    self.get(&keys.data)
                } else {
                    None
                };
                let session_timeout = self.refresh_session_ttl(keys);
                ScriptOutcome::Snapshot(LockSnapshot {
                    lock_token: holder,
                    data,
                    session_timeout,
                    newly_locked,
                })
            }
            LockScript::Peek => {
                let holder = self.get_string(&keys.lock);
                let data = if holder.is_none() {
                    self.get(&keys.data)
                } else {
                    None
                };
                let session_timeout = self.refresh_session_ttl(keys);
                ScriptOutcome::Snapshot(LockSnapshot {
                    lock_token: holder,
                    data,
                    session_timeout,
                    newly_locked: false,
                })
            }
            LockScript::ReleaseIfOwned {
                token,
                fallback_timeout_secs,
            } => {
                if !self.owned_by(keys, token) {
                    return ScriptOutcome::Applied(false);
                }
                self.delete(&keys.lock);
                if self.refresh_session_ttl(keys).is_none() {
                    let ttl = Duration::from_secs(u64::from(*fallback_timeout_secs));
                    self.expire(&keys.data, ttl);
                    self.expire(&keys.meta, ttl);
                }
                ScriptOutcome::Applied(true)
            }
            LockScript::RemoveIfOwned { token } => {
                if !self.owned_by(keys, token) {
                    return ScriptOutcome::Applied(false);
                }
                self.delete(&keys.lock);
                self.delete(&keys.data);
                self.delete(&keys.meta);
                ScriptOutcome::Applied(true)
            }
            LockScript::UpdateAndRelease {
                token,
                data,
                timeout_secs,
            } => {
                if !self.owned_by(keys, token) {
                    return ScriptOutcome::Applied(false);
                }
                let ttl = Some(Duration::from_secs(u64::from(*timeout_secs)));
                self.set(&keys.data, data.clone(), ttl);
                self.set(&keys.meta, timeout_secs.to_string().into_bytes(), ttl);
                self.delete(&keys.lock);
                ScriptOutcome::Applied(true)
            }
            LockScript::ResetTimeout { timeout_secs } => {
                let ttl = Duration::from_secs(u64::from(*timeout_secs));
                if !self.expire(&keys.data, ttl) {
                    return ScriptOutcome::Applied(false);
                }
                self.set(&keys.meta, timeout_secs.to_string().into_bytes(), Some(ttl));
                ScriptOutcome::Applied(true)
            }
        }
    }
}

/// Hands out transports over one [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    scripting: bool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            scripting: true,
        }
    }

    /// Transports from this connector refuse `eval`, like a server with
    /// scripting disabled.
    pub fn without_scripting(mut self) -> Self {
        self.scripting = false;
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, StoreError> {
        Ok(Arc::new(MemoryTransport {
            store: self.store.clone(),
            scripting: self.scripting,
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "memory://".into()
    }
}

/// One handle onto a [`MemoryStore`].
pub struct MemoryTransport {
    store: MemoryStore,
    scripting: bool,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn with_keyspace<T>(&self, f: impl FnOnce(&mut Keyspace<'_>) -> T) -> Result<T, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StaleHandle);
        }
        let mut entries = self.store.entries.lock();
        let mut keyspace = Keyspace {
            entries: &mut *entries,
            now: Instant::now(),
        };
        Ok(f(&mut keyspace))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_keyspace(|ks| ks.get(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_keyspace(|ks| ks.set(key, value.to_vec(), ttl))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.with_keyspace(|ks| ks.set_if_absent(key, value.to_vec(), ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_keyspace(|ks| ks.expire(key, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_keyspace(|ks| ks.delete(key))
    }

    async fn eval(
        &self,
        keys: &SessionKeys,
        script: &LockScript,
    ) -> Result<ScriptOutcome, StoreError> {
        if !self.scripting {
            return Err(StoreError::Command(
                "ERR scripting is disabled on this store".into(),
            ));
        }
        self.with_keyspace(|ks| ks.run(keys, script))
    }

    fn supports_scripting(&self) -> bool {
        self.scripting
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
