//! Store client with fault remediation and a bounded retry loop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachet_types::{SessionKeys, StoreError};

use crate::connection::SharedConnection;
use crate::retry::RetryPolicy;
use crate::transport::{LockScript, ScriptOutcome, Transport};

/// Client for the remote store.
///
/// Every call runs through two layers. The executor applies a one-shot
/// remedy for each transient fault (reconnect, fresh handle, resubmit) and
/// tries again once. The outer loop repeats the executor until the
/// [`RetryPolicy`] budget is spent.
#[derive(Clone)]
pub struct RetryingClient {
    connection: Arc<SharedConnection>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(connection: Arc<SharedConnection>) -> Self {
        Self {
            connection,
            policy: RetryPolicy::default(),
        }
    }

    /// Set the retry policy for transient faults.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn connection(&self) -> &Arc<SharedConnection> {
        &self.connection
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run("get", move |t| async move { t.get(key).await })
            .await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.run("set", move |t| async move { t.set(key, value, None).await })
            .await
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.run("set", move |t| async move {
            t.set(key, value, Some(ttl)).await
        })
        .await
    }

    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.run("set-if-absent", move |t| async move {
            t.set_if_absent(key, value, ttl).await
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.run("expire", move |t| async move { t.expire(key, ttl).await })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.run("delete", move |t| async move { t.delete(key).await })
            .await
    }

    pub async fn eval(
        &self,
        keys: &SessionKeys,
        script: &LockScript,
    ) -> Result<ScriptOutcome, StoreError> {
        self.run(script.name(), move |t| async move {
            t.eval(keys, script).await
        })
        .await
    }

    /// Whether the connected backend runs lock scripts. Connects if needed.
    pub async fn supports_scripting(&self) -> Result<bool, StoreError> {
        self.run("probe", |t| async move { Ok(t.supports_scripting()) })
            .await
    }

    /// Repeat the executor until success, a permanent fault, or the budget
    /// runs out.
    async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            tracing::debug!("{operation} (attempt {attempts})");

            let err = match self.execute(&op).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }

            match self.policy.delay_before_retry(attempts, started.elapsed()) {
                Some(delay) => {
                    tracing::warn!(
                        "Transient store fault in {operation} (attempt {attempts}): {err}. Retrying in {}ms...",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        "{operation} failed after {attempts} attempts over {}ms: {err}",
                        started.elapsed().as_millis()
                    );
                    return Err(StoreError::Unavailable {
                        operation,
                        attempts,
                        last: Box::new(err),
                    });
                }
            }
        }
    }

    /// One attempt, plus a single retry after remedying a transient fault.
    async fn execute<T, F, Fut>(&self, op: &F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (transport, generation) = self.connection.current().await?;
        match op(transport).await {
            Err(StoreError::ConnectionSevered(reason)) => {
                tracing::warn!("Connection severed ({reason}), reconnecting");
                let transport = self.connection.force_reconnect(generation).await?;
                op(transport).await
            }
            Err(StoreError::StaleHandle) => {
                let (transport, _) = self.connection.current().await?;
                op(transport).await
            }
            Err(StoreError::ScriptNotRegistered) => {
                tracing::debug!("Script not registered, resubmitting");
                let (transport, _) = self.connection.current().await?;
                op(transport).await
            }
            other => other,
        }
    }
}
