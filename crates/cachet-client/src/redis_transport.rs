//! Redis backend over a multiplexed async connection.

use crate::transport::{Connector, LockScript, LockSnapshot, ScriptOutcome, Transport};
use async_trait::async_trait;
use cachet_types::{ConfigError, SessionKeys, StoreError};
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, Script};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// All scripts take KEYS = { lock, data, meta }.
// Acquire and peek reply { holder, data, timeout (-1 if unknown), newly_locked }.
// The mutation scripts reply 1 if the ownership check passed, else 0.
// Reset-timeout replies 1 if the session data exists, else 0.

const ACQUIRE_LUA: &str = r"
local newly_locked = 0
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    newly_locked = 1
end
local holder = redis.call('GET', KEYS[1])
local data = false
if holder == ARGV[1] then
    data = redis.call('GET', KEYS[2])
end
local timeout = tonumber(redis.call('GET', KEYS[3]))
if timeout then
    redis.call('EXPIRE', KEYS[2], timeout)
    redis.call('EXPIRE', KEYS[3], timeout)
else
    timeout = -1
end
return { holder, data, timeout, newly_locked }
";

const PEEK_LUA: &str = r"
local holder = redis.call('GET', KEYS[1])
local data = false
if not holder then
    data = redis.call('GET', KEYS[2])
end
local timeout = tonumber(redis.call('GET', KEYS[3]))
if timeout then
    redis.call('EXPIRE', KEYS[2], timeout)
    redis.call('EXPIRE', KEYS[3], timeout)
else
    timeout = -1
end
return { holder, data, timeout, 0 }
";

const RELEASE_LUA: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
local timeout = tonumber(redis.call('GET', KEYS[3])) or tonumber(ARGV[2])
redis.call('EXPIRE', KEYS[2], timeout)
redis.call('EXPIRE', KEYS[3], timeout)
return 1
";

const REMOVE_LUA: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
return 1
";

const UPDATE_LUA: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[3], ARGV[3], 'EX', ARGV[3])
redis.call('DEL', KEYS[1])
return 1
";

const RESET_TIMEOUT_LUA: &str = r"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return 0
end
redis.call('EXPIRE', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[1], 'EX', ARGV[1])
return 1
";

/// Compiled scripts, hashed once per connector.
struct LockScripts {
    acquire: Script,
    peek: Script,
    release: Script,
    remove: Script,
    update: Script,
    reset_timeout: Script,
}

impl LockScripts {
    fn new() -> Self {
        Self {
            acquire: Script::new(ACQUIRE_LUA),
            peek: Script::new(PEEK_LUA),
            release: Script::new(RELEASE_LUA),
            remove: Script::new(REMOVE_LUA),
            update: Script::new(UPDATE_LUA),
            reset_timeout: Script::new(RESET_TIMEOUT_LUA),
        }
    }
}

/// Opens multiplexed connections, trying endpoints in order.
pub struct RedisConnector {
    endpoints: Vec<(String, redis::Client)>,
    scripts: Arc<LockScripts>,
}

impl RedisConnector {
    /// Parse every endpoint up front so a bad URL fails at startup.
    pub fn new(endpoints: &[String]) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "store.endpoints".into(),
            });
        }
        let endpoints = endpoints
            .iter()
            .map(|endpoint| {
                redis::Client::open(endpoint.as_str())
                    .map(|client| (endpoint.clone(), client))
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "store.endpoints".into(),
                        message: format!("{endpoint}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            endpoints,
            scripts: Arc::new(LockScripts::new()),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, StoreError> {
        let mut last_error = None;
        for (endpoint, client) in &self.endpoints {
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    return Ok(Arc::new(RedisTransport {
                        conn,
                        scripts: Arc::clone(&self.scripts),
                        closed: AtomicBool::new(false),
                    }));
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {endpoint}: {e}");
                    last_error = Some(format!("{endpoint}: {e}"));
                }
            }
        }
        Err(StoreError::ConnectionSevered(
            last_error.unwrap_or_else(|| "no endpoints".into()),
        ))
    }

    fn describe(&self) -> String {
        self.endpoints
            .iter()
            .map(|(endpoint, _)| endpoint.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A multiplexed connection. Cheap to clone per command.
pub struct RedisTransport {
    conn: MultiplexedConnection,
    scripts: Arc<LockScripts>,
    closed: AtomicBool,
}

impl RedisTransport {
    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StaleHandle);
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(classify)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        // OK when written, nil when the key already existed
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(classify)?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(applied == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(removed > 0)
    }

    async fn eval(
        &self,
        keys: &SessionKeys,
        script: &LockScript,
    ) -> Result<ScriptOutcome, StoreError> {
        let mut conn = self.connection()?;
        let scripts = &self.scripts;
        let compiled = match script {
            LockScript::Acquire { .. } => &scripts.acquire,
            LockScript::Peek => &scripts.peek,
            LockScript::ReleaseIfOwned { .. } => &scripts.release,
            LockScript::RemoveIfOwned { .. } => &scripts.remove,
            LockScript::UpdateAndRelease { .. } => &scripts.update,
            LockScript::ResetTimeout { .. } => &scripts.reset_timeout,
        };
        let mut invocation = compiled.prepare_invoke();
        invocation.key(&keys.lock).key(&keys.data).key(&keys.meta);
        match script {
            LockScript::Acquire {
                token,
                lock_ttl_secs,
            } => {
                invocation.arg(token).arg(*lock_ttl_secs);
            }
            LockScript::Peek => {}
            LockScript::ReleaseIfOwned {
                token,
                fallback_timeout_secs,
            } => {
                invocation.arg(token).arg(*fallback_timeout_secs);
            }
            LockScript::RemoveIfOwned { token } => {
                invocation.arg(token);
            }
            LockScript::UpdateAndRelease {
                token,
                data,
                timeout_secs,
            } => {
                invocation.arg(token).arg(data.as_slice()).arg(*timeout_secs);
            }
            LockScript::ResetTimeout { timeout_secs } => {
                invocation.arg(*timeout_secs);
            }
        }

        match script {
            LockScript::Acquire { .. } | LockScript::Peek => {
                let (holder, data, timeout, newly_locked): (
                    Option<String>,
                    Option<Vec<u8>>,
                    i64,
                    i64,
                ) = invocation
                    .invoke_async(&mut conn)
                    .await
                    .map_err(classify)?;
                Ok(ScriptOutcome::Snapshot(LockSnapshot {
                    lock_token: holder,
                    data,
                    session_timeout: u32::try_from(timeout).ok(),
                    newly_locked: newly_locked == 1,
                }))
            }
            _ => {
                let applied: i64 = invocation
                    .invoke_async(&mut conn)
                    .await
                    .map_err(classify)?;
                Ok(ScriptOutcome::Applied(applied == 1))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server
    (ttl.as_millis() as u64).max(1)
}

/// Map a client error onto the store fault taxonomy.
fn classify(e: RedisError) -> StoreError {
    if e.kind() == ErrorKind::NoScriptError {
        StoreError::ScriptNotRegistered
    } else if e.is_timeout() {
        // The command may have run; retrying could apply it twice
        StoreError::Command(e.to_string())
    } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        StoreError::ConnectionSevered(e.to_string())
    } else if e.kind() == ErrorKind::TypeError {
        StoreError::Protocol(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_noscript() {
        let err = RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT No matching script"));
        assert!(matches!(classify(err), StoreError::ScriptNotRegistered));
    }

    #[test]
    fn classify_io_error_is_severed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = RedisError::from(io);
        assert!(matches!(classify(err), StoreError::ConnectionSevered(_)));
    }

    #[test]
    fn classify_type_error_is_protocol() {
        let err = RedisError::from((ErrorKind::TypeError, "Response was of incompatible type"));
        assert!(matches!(classify(err), StoreError::Protocol(_)));
    }

    #[test]
    fn classify_server_error_is_command() {
        let err = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        let classified = classify(err);
        assert!(matches!(classified, StoreError::Command(_)));
        assert!(!classified.is_transient());
    }

    #[test]
    fn ttl_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let err = match RedisConnector::new(&["redis://host:notaport".to_string()]) {
            Err(e) => e,
            Ok(_) => panic!("expected a config error"),
        };
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn describe_lists_endpoints() {
        let connector = RedisConnector::new(&[
            "redis://a:6379".to_string(),
            "redis://b:6379".to_string(),
        ])
        .unwrap();
        assert_eq!(connector.describe(), "redis://a:6379,redis://b:6379");
    }
}
