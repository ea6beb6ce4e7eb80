//! Process-wide connection handle with lazy connect and forced reconnect.

use crate::memory::MemoryConnector;
use crate::redis_transport::RedisConnector;
use crate::transport::{Connector, Transport};
use cachet_types::{ConfigError, StoreError};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to the remote store.
///
/// Create one per process and hand out clones of the `Arc`. The first
/// operation connects; a forced reconnect swaps the transport underneath
/// while every holder keeps the same handle.
pub struct SharedConnection {
    connector: Arc<dyn Connector>,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    current: Option<Arc<dyn Transport>>,
    generation: u64,
}

impl SharedConnection {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            state: RwLock::new(State::default()),
        })
    }

    /// Build a handle for the configured endpoints.
    pub fn for_endpoints(endpoints: &[String]) -> Result<Arc<Self>, ConfigError> {
        Ok(Self::new(connector_for(endpoints)?))
    }

    /// The live transport and its generation, connecting on first use.
    pub async fn current(&self) -> Result<(Arc<dyn Transport>, u64), StoreError> {
        {
            let state = self.state.read().await;
            if let Some(transport) = &state.current {
                return Ok((Arc::clone(transport), state.generation));
            }
        }

        let mut state = self.state.write().await;
        // Another task may have connected while we waited for the write lock
        if let Some(transport) = &state.current {
            return Ok((Arc::clone(transport), state.generation));
        }
        let transport = self.connector.connect().await?;
        state.generation += 1;
        state.current = Some(Arc::clone(&transport));
        tracing::debug!(
            "Connected to {} (generation {})",
            self.connector.describe(),
            state.generation
        );
        Ok((transport, state.generation))
    }

    /// Replace the transport observed at `observed_generation`.
    ///
    /// If another task already reconnected, its transport is returned and no
    /// new connection is made. The replaced transport is closed so in-flight
    /// holders see [`StoreError::StaleHandle`].
    pub async fn force_reconnect(
        &self,
        observed_generation: u64,
    ) -> Result<Arc<dyn Transport>, StoreError> {
        let mut state = self.state.write().await;
        if let Some(transport) = &state.current {
            if state.generation != observed_generation {
                return Ok(Arc::clone(transport));
            }
        }
        if let Some(old) = state.current.take() {
            old.close().await;
        }
        let transport = self.connector.connect().await?;
        state.generation += 1;
        state.current = Some(Arc::clone(&transport));
        tracing::info!(
            "Reconnected to {} (generation {})",
            self.connector.describe(),
            state.generation
        );
        Ok(transport)
    }

    /// Number of successful connects so far.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }
}

/// Pick a backend from the endpoint scheme.
pub fn connector_for(endpoints: &[String]) -> Result<Arc<dyn Connector>, ConfigError> {
    let Some(first) = endpoints.first() else {
        return Err(ConfigError::MissingKey {
            key: "store.endpoints".into(),
        });
    };
    if first.starts_with("memory://") {
        if endpoints.len() > 1 {
            return Err(ConfigError::InvalidValue {
                key: "store.endpoints".into(),
                message: "memory:// cannot be combined with other endpoints".into(),
            });
        }
        return Ok(Arc::new(MemoryConnector::new()));
    }
    Ok(Arc::new(RedisConnector::new(endpoints)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts connects and hands out memory transports.
    struct CountingConnector {
        inner: MemoryConnector,
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn Transport>, StoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Widen the race window between concurrent first users
            tokio::task::yield_now().await;
            self.inner.connect().await
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn counting() -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            inner: MemoryConnector::new(),
            connects: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn lazy_connect_happens_once() {
        let connector = counting();
        let shared = SharedConnection::new(connector.clone());
        assert_eq!(shared.generation().await, 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(async move { shared.current().await.map(|(_, g)| g) }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_closes_old_transport() {
        let shared = SharedConnection::new(counting());
        let (old, generation) = shared.current().await.unwrap();
        old.set("k", b"v", None).await.unwrap();

        let fresh = shared.force_reconnect(generation).await.unwrap();
        assert_eq!(shared.generation().await, 2);
        assert!(matches!(old.get("k").await, Err(StoreError::StaleHandle)));
        // Same backing store, new handle
        assert_eq!(fresh.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn concurrent_reconnects_collapse() {
        let connector = counting();
        let shared = SharedConnection::new(connector.clone());
        let (_, generation) = shared.current().await.unwrap();

        shared.force_reconnect(generation).await.unwrap();
        // A second task that observed the same failure reuses the new transport
        shared.force_reconnect(generation).await.unwrap();

        assert_eq!(shared.generation().await, 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connector_for_rejects_mixed_memory() {
        let endpoints = vec!["memory://".to_string(), "redis://a:6379".to_string()];
        assert!(matches!(
            connector_for(&endpoints),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn connector_for_requires_endpoint() {
        assert!(matches!(
            connector_for(&[]),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn connector_for_memory() {
        let connector = connector_for(&["memory://".to_string()]).unwrap();
        assert_eq!(connector.describe(), "memory://");
    }
}
