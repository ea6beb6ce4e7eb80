//! Lock-free cache of rendered responses, shared across the fleet.
//!
//! Writes are last-writer-wins except [`OutputCache::add`], which keeps the
//! first entry stored under a key.

use std::time::Duration;

use cachet_client::{RetryPolicy, RetryingClient, SharedConnection};
use cachet_config::CachetConfig;
use cachet_types::{CachetError, KeyNamespacer, OutputCacheEntry, StoreError};
use chrono::{DateTime, Utc};

/// Output cache for one application.
#[derive(Clone)]
pub struct OutputCache {
    client: RetryingClient,
    namespacer: KeyNamespacer,
}

impl OutputCache {
    pub fn new(client: RetryingClient, namespacer: KeyNamespacer) -> Self {
        Self { client, namespacer }
    }

    /// Build a cache from resolved configuration with its own connection.
    pub fn connect(config: &CachetConfig) -> Result<Self, CachetError> {
        let namespacer = KeyNamespacer::new(config.application_name.clone())?;
        let connection = SharedConnection::for_endpoints(&config.endpoints)?;
        let client = RetryingClient::new(connection)
            .with_retry_policy(RetryPolicy::with_timeout(config.retry_timeout));
        Ok(Self::new(client, namespacer))
    }

    /// Store `entry` unless the key already holds one.
    ///
    /// Returns whichever entry the key holds afterwards. An `expiry` in the
    /// past stores nothing and hands the candidate back.
    pub async fn add(
        &self,
        key: &str,
        entry: &OutputCacheEntry,
        expiry: DateTime<Utc>,
    ) -> Result<OutputCacheEntry, StoreError> {
        let Some(ttl) = ttl_until(expiry, Utc::now()) else {
            return Ok(entry.clone());
        };
        let cache_key = self.namespacer.cache_key(key);
        let Some(bytes) = encode(entry) else {
            return Ok(entry.clone());
        };

        if self
            .client
            .set_if_absent(&cache_key, &bytes, Some(ttl))
            .await?
        {
            return Ok(entry.clone());
        }
        if let Some(existing) = self.read(&cache_key).await? {
            return Ok(existing);
        }
        // The first writer's entry expired or was removed in between
        tracing::debug!("Cache entry '{cache_key}' vanished during add, storing candidate");
        self.client.set_with_ttl(&cache_key, &bytes, ttl).await?;
        Ok(entry.clone())
    }

    /// Store `entry`, replacing any existing one. An `expiry` in the past
    /// removes the key instead.
    pub async fn set(
        &self,
        key: &str,
        entry: &OutputCacheEntry,
        expiry: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let cache_key = self.namespacer.cache_key(key);
        let Some(ttl) = ttl_until(expiry, Utc::now()) else {
            self.client.delete(&cache_key).await?;
            return Ok(());
        };
        match encode(entry) {
            Some(bytes) => self.client.set_with_ttl(&cache_key, &bytes, ttl).await,
            None => Ok(()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<OutputCacheEntry>, StoreError> {
        self.read(&self.namespacer.cache_key(key)).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete(&self.namespacer.cache_key(key))
            .await
            .map(|_| ())
    }

    async fn read(&self, cache_key: &str) -> Result<Option<OutputCacheEntry>, StoreError> {
        let Some(bytes) = self.client.get(cache_key).await? else {
            return Ok(None);
        };
        match postcard::from_bytes(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry '{cache_key}': {e}");
                Ok(None)
            }
        }
    }
}

fn encode(entry: &OutputCacheEntry) -> Option<Vec<u8>> {
    match postcard::to_allocvec(entry) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!("Failed to encode cache entry: {e}");
            None
        }
    }
}

/// Time left until `expiry`, or `None` if it has passed.
fn ttl_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (expiry - now).to_std().ok().filter(|ttl| !ttl.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_client::{MemoryConnector, MemoryStore};
    use cachet_types::{CachedResponse, CachedVary};
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn cache() -> (OutputCache, MemoryStore) {
        let connector = MemoryConnector::new();
        let store = connector.store().clone();
        let client = RetryingClient::new(SharedConnection::new(Arc::new(connector)));
        (
            OutputCache::new(client, KeyNamespacer::new("site").unwrap()),
            store,
        )
    }

    fn page(body: &str) -> OutputCacheEntry {
        OutputCacheEntry::Response(CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/html".into())],
            body: body.as_bytes().to_vec(),
        })
    }

    fn in_secs(n: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::seconds(n)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (cache, store) = cache();
        cache.set("/home", &page("hi"), in_secs(60)).await.unwrap();
        assert_eq!(cache.get("/home").await.unwrap(), Some(page("hi")));
        assert!(store.contains("site_/home"));
        assert!(store.ttl("site_/home").unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn set_overwrites() {
        let (cache, _) = cache();
        cache.set("/home", &page("old"), in_secs(60)).await.unwrap();
        cache.set("/home", &page("new"), in_secs(60)).await.unwrap();
        assert_eq!(cache.get("/home").await.unwrap(), Some(page("new")));
    }

    #[tokio::test]
    async fn set_with_past_expiry_deletes() {
        let (cache, store) = cache();
        cache.set("/home", &page("hi"), in_secs(60)).await.unwrap();
        cache.set("/home", &page("hi"), in_secs(-1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn add_is_first_writer_wins() {
        let (cache, _) = cache();
        let first = cache.add("/home", &page("first"), in_secs(60)).await.unwrap();
        let second = cache.add("/home", &page("second"), in_secs(60)).await.unwrap();
        assert_eq!(first, page("first"));
        assert_eq!(second, page("first"));
        assert_eq!(cache.get("/home").await.unwrap(), Some(page("first")));
    }

    #[tokio::test]
    async fn add_with_past_expiry_stores_nothing() {
        let (cache, store) = cache();
        let returned = cache.add("/home", &page("late"), in_secs(-5)).await.unwrap();
        assert_eq!(returned, page("late"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn add_replaces_undecodable_entry() {
        let (cache, _) = cache();
        cache.client.set("site_/home", b"\xff\xff\xff").await.unwrap();
        let returned = cache.add("/home", &page("fresh"), in_secs(60)).await.unwrap();
        assert_eq!(returned, page("fresh"));
        assert_eq!(cache.get("/home").await.unwrap(), Some(page("fresh")));
    }

    #[tokio::test]
    async fn remove_and_missing() {
        let (cache, _) = cache();
        let vary = OutputCacheEntry::Vary(CachedVary {
            headers: vec!["accept-language".into()],
            ..CachedVary::default()
        });
        cache.set("/vary", &vary, in_secs(60)).await.unwrap();
        assert_eq!(cache.get("/vary").await.unwrap(), Some(vary));
        cache.remove("/vary").await.unwrap();
        assert_eq!(cache.get("/vary").await.unwrap(), None);
        cache.remove("/never-set").await.unwrap();
    }

    #[tokio::test]
    async fn garbage_reads_as_absent() {
        let (cache, _) = cache();
        cache.client.set("site_/raw", b"\xff\xff\xff").await.unwrap();
        assert_eq!(cache.get("/raw").await.unwrap(), None);
    }

    #[test]
    fn ttl_computation() {
        let now = Utc::now();
        assert_eq!(
            ttl_until(now + TimeDelta::milliseconds(1500), now),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(ttl_until(now, now), None);
        assert_eq!(ttl_until(now - TimeDelta::seconds(1), now), None);
    }
}
