// Cache contract consumed by the engine, with an in-memory fallback when no
// shared backend (e.g. Redis) is wired in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not a counter value: {0}")]
    NotACounter(String),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    /// Atomically increments the counter at `key` and returns the new value.
    /// When the key is absent or expired the counter is seeded with `initial`
    /// before the increment, so the first caller gets `initial + 1`.
    async fn incr_from(
        &self,
        key: &str,
        initial: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError>;
}

// In-memory cache implementation as fallback
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            Instant::now() > expires_at
        } else {
            false
        }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let store = self.store.read().unwrap();
        if let Some(entry) = store.get(key) {
            if entry.is_expired() {
                drop(store);
                let mut store = self.store.write().unwrap();
                store.remove(key);
                Ok(None)
            } else {
                Ok(Some(entry.value.clone()))
            }
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let store = self.store.read().unwrap();
        if let Some(entry) = store.get(key) {
            Ok(!entry.is_expired())
        } else {
            Ok(false)
        }
    }

    async fn incr_from(
        &self,
        key: &str,
        initial: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        // Single write lock so seed-and-increment is one atomic step.
        let mut store = self.store.write().unwrap();

        let current = match store.get(key) {
            Some(entry) if !entry.is_expired() => Some(
                entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| CacheError::NotACounter(entry.value.clone()))?,
            ),
            _ => None,
        };

        let next = current.unwrap_or(initial) + 1;

        // Seeding sets the TTL; plain increments keep the existing deadline so
        // the counter still rolls over with the day.
        let expires_at = match (current, store.get(key)) {
            (Some(_), Some(entry)) => entry.expires_at,
            _ => ttl.map(|d| Instant::now() + d),
        };

        store.insert(
            key.to_string(),
            CacheEntry {
                value: next.to_string(),
                expires_at,
            },
        );

        Ok(next)
    }
}
