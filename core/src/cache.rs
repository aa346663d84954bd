use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::models::CachedSubscription;

fn cache_key(subscription_id: &Uuid) -> String {
    format!("subscription:{subscription_id}")
}

/// Bounded-TTL cache that shields the ingestion and delivery hot paths from
/// the database.
///
/// Two backends are available: a per-process in-memory map (the default) and
/// Redis, which lets the API and the worker share one coherent view. The
/// cache is never a correctness authority: every operation degrades to a miss
/// or a no-op on backend failure, and an entry that cannot be parsed is
/// dropped and treated as a miss.
#[derive(Clone)]
pub enum SubscriptionCache {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl SubscriptionCache {
    pub fn in_memory(ttl: Duration) -> Self {
        Self::Memory(MemoryCache::new(ttl))
    }

    pub async fn redis(url: &str, ttl: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::Redis(RedisCache { ttl, conn }))
    }

    pub async fn get(&self, subscription_id: &Uuid) -> Option<CachedSubscription> {
        match self {
            Self::Memory(cache) => cache.get(subscription_id),
            Self::Redis(cache) => cache.get(subscription_id).await,
        }
    }

    pub async fn put(&self, subscription_id: &Uuid, entry: &CachedSubscription) {
        match self {
            Self::Memory(cache) => cache.put(subscription_id, entry),
            Self::Redis(cache) => cache.put(subscription_id, entry).await,
        }
    }

    pub async fn invalidate(&self, subscription_id: &Uuid) {
        match self {
            Self::Memory(cache) => cache.invalidate(subscription_id),
            Self::Redis(cache) => cache.invalidate(subscription_id).await,
        }
    }
}

#[derive(Clone)]
pub struct MemoryCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<Uuid, (Instant, CachedSubscription)>>>,
}

impl MemoryCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn get(&self, subscription_id: &Uuid) -> Option<CachedSubscription> {
        let mut entries = self.entries.lock().expect("subscription cache mutex");
        match entries.get(subscription_id) {
            Some((expires_at, _)) if *expires_at <= Instant::now() => {
                entries.remove(subscription_id);
                None
            }
            Some((_, entry)) => Some(entry.to_owned()),
            None => None,
        }
    }

    fn put(&self, subscription_id: &Uuid, entry: &CachedSubscription) {
        let mut entries = self.entries.lock().expect("subscription cache mutex");
        entries.insert(
            subscription_id.to_owned(),
            (Instant::now() + self.ttl, entry.to_owned()),
        );
    }

    fn invalidate(&self, subscription_id: &Uuid) {
        let mut entries = self.entries.lock().expect("subscription cache mutex");
        entries.remove(subscription_id);
    }
}

#[derive(Clone)]
pub struct RedisCache {
    ttl: Duration,
    conn: ConnectionManager,
}

impl RedisCache {
    async fn get(&self, subscription_id: &Uuid) -> Option<CachedSubscription> {
        let key = cache_key(subscription_id);
        let mut conn = self.conn.clone();

        let raw = match conn.get::<_, Option<String>>(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not read subscription cache entry '{key}': {e}");
                return None;
            }
        };

        match raw.as_deref().map(serde_json::from_str) {
            Some(Ok(entry)) => Some(entry),
            Some(Err(e)) => {
                // Unparseable entries are dropped so the caller falls back to
                // the database and repopulates
                debug!("Dropping corrupted subscription cache entry '{key}': {e}");
                self.invalidate(subscription_id).await;
                None
            }
            None => None,
        }
    }

    async fn put(&self, subscription_id: &Uuid, entry: &CachedSubscription) {
        let key = cache_key(subscription_id);
        let serialized = match serde_json::to_string(entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!("Could not serialize subscription cache entry '{key}': {e}");
                return;
            }
        };

        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, serialized, self.ttl.as_secs())
            .await
        {
            warn!("Could not write subscription cache entry '{key}': {e}");
        }
    }

    async fn invalidate(&self, subscription_id: &Uuid) {
        let key = cache_key(subscription_id);
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(&key).await {
            warn!("Could not invalidate subscription cache entry '{key}': {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target_url: &str) -> CachedSubscription {
        CachedSubscription {
            target_url: target_url.to_owned(),
            secret: Some("s3cret".to_owned()),
            event_type_filter: None,
        }
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = SubscriptionCache::in_memory(Duration::from_secs(60));
        let id = Uuid::new_v4();

        assert_eq!(cache.get(&id).await, None);
        cache.put(&id, &entry("https://example.com/hook")).await;
        assert_eq!(cache.get(&id).await, Some(entry("https://example.com/hook")));
    }

    #[tokio::test]
    async fn memory_cache_put_overwrites() {
        let cache = SubscriptionCache::in_memory(Duration::from_secs(60));
        let id = Uuid::new_v4();

        cache.put(&id, &entry("https://a.example.com")).await;
        cache.put(&id, &entry("https://b.example.com")).await;
        assert_eq!(cache.get(&id).await, Some(entry("https://b.example.com")));
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = SubscriptionCache::in_memory(Duration::from_millis(10));
        let id = Uuid::new_v4();

        cache.put(&id, &entry("https://example.com/hook")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&id).await, None);
    }

    #[tokio::test]
    async fn memory_cache_invalidate_removes_entries() {
        let cache = SubscriptionCache::in_memory(Duration::from_secs(60));
        let id = Uuid::new_v4();

        cache.put(&id, &entry("https://example.com/hook")).await;
        cache.invalidate(&id).await;
        assert_eq!(cache.get(&id).await, None);
    }

    #[test]
    fn cache_keys_are_namespaced_by_subscription() {
        let id = Uuid::nil();
        assert_eq!(
            cache_key(&id),
            "subscription:00000000-0000-0000-0000-000000000000"
        );
    }
}
