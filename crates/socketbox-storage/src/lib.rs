// Pluggable cache backends used for cluster discovery state.
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::RwLock;

/// Shared cache the cluster layer uses for peer discovery and election.
///
/// Implementations are expected to be shared by every node of a cluster
/// (Redis, memcached, a database table). Writes need not be atomic; the
/// cluster layer retries and re-verifies on top of this interface.
#[async_trait]
pub trait CacheProvider: Debug + Send + Sync {
    /// Fetch a key. `None` when the key is missing.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a key, overwriting any previous value.
    async fn set(&self, key: &str, value: &str);

    /// Remove a key. Removing a missing key is a no-op.
    async fn clear(&self, key: &str);
}

/// In-memory cache for tests and single-process clusters.
///
/// ```
/// use socketbox_storage::{CacheProvider, EphemeralCache};
///
/// let cache = EphemeralCache::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     cache.set("k", "v").await;
///     assert_eq!(cache.get("k").await.as_deref(), Some("v"));
/// });
/// ```
#[derive(Debug, Default)]
pub struct EphemeralCache {
    // RwLock allows concurrent readers while updates take exclusive access.
    inner: RwLock<HashMap<String, String>>,
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<EphemeralCache> for Box<dyn CacheProvider> {
    fn from(value: EphemeralCache) -> Self {
        Box::new(value)
    }
}

#[async_trait]
impl CacheProvider for EphemeralCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }

    async fn clear(&self, key: &str) {
        self.inner.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_clear_round_trip() {
        let cache = EphemeralCache::new();
        assert!(cache.get("peers").await.is_none());
        cache.set("peers", "ws://a\nws://b").await;
        assert_eq!(cache.get("peers").await.as_deref(), Some("ws://a\nws://b"));
        cache.clear("peers").await;
        assert!(cache.get("peers").await.is_none());
    }

    #[tokio::test]
    async fn clear_missing_key_is_noop() {
        let cache = EphemeralCache::new();
        cache.clear("missing").await;
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn set_overwrites_previous_value() {
        let cache = EphemeralCache::new();
        cache.set("manager", "ws://a").await;
        cache.set("manager", "ws://b").await;
        assert_eq!(cache.get("manager").await.as_deref(), Some("ws://b"));
    }
}
