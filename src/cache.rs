//! Time-boxed result cache of a cache-enabled model.
//!
//! The cache holds at most one entry, replaced wholesale on every refill. A
//! lookup with a different key (projection and sort) is a miss.

use crate::materialize::Record;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct CacheEntry {
    pub timestamp: Instant,
    pub key: String,
    pub result: Arc<Vec<Record>>,
}

#[derive(Debug)]
pub struct ModelCache {
    timeout: Duration,
    entry: RwLock<Option<Arc<CacheEntry>>>,
}

impl ModelCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entry: RwLock::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The cached result for `key` if it has not expired
    pub async fn fresh(&self, key: &str) -> Option<Arc<Vec<Record>>> {
        let guard = self.entry.read().await;
        let entry = guard.as_ref()?;

        if entry.key != key {
            debug!(key, cached = %entry.key, "cache key mismatch");
            return None;
        }
        if entry.timestamp.elapsed() >= self.timeout {
            debug!(key, "cache expired");
            return None;
        }

        Some(entry.result.clone())
    }

    /// Replace the entry with a freshly loaded result
    pub async fn replace(&self, key: &str, result: Arc<Vec<Record>>) {
        let entry = CacheEntry {
            timestamp: Instant::now(),
            key: key.to_string(),
            result,
        };
        debug!(key, rows = entry.result.len(), "cache refilled");
        *self.entry.write().await = Some(Arc::new(entry));
    }

    /// Current entry, expired or not
    pub async fn snapshot(&self) -> Option<Arc<CacheEntry>> {
        self.entry.read().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Arc<Vec<Record>> {
        let mut record = Record::new();
        record.insert("id".into(), json!(1));
        Arc::new(vec![record])
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl() {
        let cache = ModelCache::new(Duration::from_secs(60));
        assert!(cache.fresh("default").await.is_none());

        let result = rows();
        cache.replace("default", result.clone()).await;

        let hit = cache.fresh("default").await.unwrap();
        assert!(Arc::ptr_eq(&hit, &result));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.fresh("default").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.fresh("default").await.is_none());
        assert!(cache.snapshot().await.is_some());
    }

    #[tokio::test]
    async fn test_key_mismatch_and_invalidate() {
        let cache = ModelCache::new(Duration::from_secs(60));
        cache.replace("default|", rows()).await;

        assert!(cache.fresh("short|").await.is_none());
        assert!(cache.fresh("default|").await.is_some());

        cache.invalidate().await;
        assert!(cache.snapshot().await.is_none());
    }
}
