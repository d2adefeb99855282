//! Identity-scoped query cache using moka
//!
//! Keys are typed tuples that carry the principal they belong to, so an
//! entry cached for one identity can never be served to another. Values are
//! kept until evicted; invalidation only marks them stale so that the next
//! read refetches.

use crate::connection::Connection;
use fieldtask_model::{Failure, Field, FieldId, Principal, Task, UserProfile};
use moka::future::Cache;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Cache key, always scoped by principal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Backend connection bound to the principal
    Connection(Principal),
    /// Caller profile
    Profile(Principal),
    /// Field list
    Fields(Principal),
    /// All tasks
    Tasks(Principal),
    /// Tasks of one field
    TasksByField(Principal, FieldId),
}

impl CacheKey {
    /// Principal the entry belongs to
    #[must_use]
    pub fn principal(&self) -> &Principal {
        match self {
            Self::Connection(p)
            | Self::Profile(p)
            | Self::Fields(p)
            | Self::Tasks(p)
            | Self::TasksByField(p, _) => p,
        }
    }

    /// Whether this is the connection entry
    #[inline]
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Cached value
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Backend connection
    Connection(Arc<Connection>),
    /// Profile; `None` when the caller has none yet
    Profile(Option<UserProfile>),
    /// Fields
    Fields(Vec<Field>),
    /// Tasks
    Tasks(Vec<Task>),
}

/// Cached value with freshness metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Value
    pub value: CacheValue,
    /// Marked stale by an invalidation; readers should refetch
    pub stale: bool,
    /// When the value was stored
    pub fetched_at: Instant,
}

/// Loads the value for a cache key
#[async_trait::async_trait]
pub trait EntryLoader: Send + Sync {
    /// Fetch a fresh value for `key`
    async fn load(&self, key: &CacheKey) -> Result<CacheValue, Failure>;
}

/// Typed capability interface over the local query cache
#[async_trait::async_trait]
pub trait QueryCache: Send + Sync {
    /// Entry for `key`, stale or not
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Store a fresh value
    async fn set(&self, key: CacheKey, value: CacheValue);

    /// Mark an entry stale without removing it
    async fn invalidate(&self, key: &CacheKey);

    /// Mark every matching entry stale; returns how many were marked
    async fn invalidate_matching(&self, predicate: &(dyn for<'k> Fn(&'k CacheKey) -> bool + Send + Sync)) -> usize;

    /// Remove an entry so it can never be read again
    async fn evict(&self, key: &CacheKey);

    /// Remove every entry
    async fn clear(&self);

    /// Load a fresh value for `key` and store it
    async fn refetch(&self, key: CacheKey, loader: &dyn EntryLoader) -> Result<CacheValue, Failure> {
        let value = loader.load(&key).await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// [`QueryCache`] backed by a moka future cache
#[derive(Debug, Clone)]
pub struct MokaQueryCache {
    inner: Cache<CacheKey, CacheEntry>,
}

impl MokaQueryCache {
    /// Create cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }

    /// Keys currently stored
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.iter().map(|(key, _)| (*key).clone()).collect()
    }

    async fn mark_stale(&self, key: &CacheKey) -> bool {
        match self.inner.get(key).await {
            Some(mut entry) if !entry.stale => {
                entry.stale = true;
                self.inner.insert(key.clone(), entry).await;
                true
            }
            _ => false,
        }
    }
}

impl Default for MokaQueryCache {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[async_trait::async_trait]
impl QueryCache for MokaQueryCache {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.get(key).await
    }

    async fn set(&self, key: CacheKey, value: CacheValue) {
        debug!(?key, "cache set");
        let entry = CacheEntry {
            value,
            stale: false,
            fetched_at: Instant::now(),
        };
        self.inner.insert(key, entry).await;
    }

    async fn invalidate(&self, key: &CacheKey) {
        debug!(?key, "cache invalidate");
        self.mark_stale(key).await;
    }

    async fn invalidate_matching(&self, predicate: &(dyn for<'k> Fn(&'k CacheKey) -> bool + Send + Sync)) -> usize {
        let matching: Vec<CacheKey> = self.keys().into_iter().filter(|key| predicate(key)).collect();
        let mut marked = 0;
        for key in &matching {
            if self.mark_stale(key).await {
                marked += 1;
            }
        }
        debug!(marked, "cache invalidate matching");
        marked
    }

    async fn evict(&self, key: &CacheKey) {
        debug!(?key, "cache evict");
        self.inner.invalidate(key).await;
    }

    async fn clear(&self) {
        debug!("cache clear");
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal::new("alice")
    }

    fn bob() -> Principal {
        Principal::new("bob")
    }

    struct FixedLoader;

    #[async_trait::async_trait]
    impl EntryLoader for FixedLoader {
        async fn load(&self, key: &CacheKey) -> Result<CacheValue, Failure> {
            match key {
                CacheKey::Profile(p) => Ok(CacheValue::Profile(Some(UserProfile::new(p.as_str())))),
                _ => Err(Failure::from("not loadable")),
            }
        }
    }

    #[test]
    fn keys_are_principal_scoped() {
        let a = CacheKey::Profile(alice());
        let b = CacheKey::Profile(bob());
        assert_ne!(a, b);
        assert_eq!(a.principal(), &alice());
        assert!(CacheKey::Connection(alice()).is_connection());
        assert!(!a.is_connection());
    }

    #[tokio::test]
    async fn set_get_and_invalidate() {
        let cache = MokaQueryCache::new(16);
        let key = CacheKey::Profile(alice());

        cache.set(key.clone(), CacheValue::Profile(None)).await;
        let entry = cache.get(&key).await.unwrap();
        assert!(!entry.stale);

        cache.invalidate(&key).await;
        let entry = cache.get(&key).await.unwrap();
        assert!(entry.stale);
        assert!(matches!(entry.value, CacheValue::Profile(None)));

        // Other principals are untouched
        assert!(cache.get(&CacheKey::Profile(bob())).await.is_none());
    }

    #[tokio::test]
    async fn evict_removes_entry() {
        let cache = MokaQueryCache::new(16);
        let key = CacheKey::Fields(alice());
        cache.set(key.clone(), CacheValue::Fields(Vec::new())).await;
        cache.evict(&key).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_matching_spares_excluded_keys() {
        let cache = MokaQueryCache::new(16);
        cache.set(CacheKey::Profile(alice()), CacheValue::Profile(None)).await;
        cache.set(CacheKey::Fields(alice()), CacheValue::Fields(Vec::new())).await;
        cache.set(CacheKey::Tasks(bob()), CacheValue::Tasks(Vec::new())).await;

        let marked = cache.invalidate_matching(&|key: &CacheKey| !matches!(key, CacheKey::Tasks(_))).await;
        assert_eq!(marked, 2);
        assert!(cache.get(&CacheKey::Profile(alice())).await.unwrap().stale);
        assert!(!cache.get(&CacheKey::Tasks(bob())).await.unwrap().stale);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = MokaQueryCache::new(16);
        cache.set(CacheKey::Profile(alice()), CacheValue::Profile(None)).await;
        cache.set(CacheKey::Profile(bob()), CacheValue::Profile(None)).await;
        cache.clear().await;
        assert!(cache.get(&CacheKey::Profile(alice())).await.is_none());
        assert!(cache.get(&CacheKey::Profile(bob())).await.is_none());
    }

    #[tokio::test]
    async fn refetch_stores_fresh_value() {
        let cache = MokaQueryCache::new(16);
        let key = CacheKey::Profile(alice());
        cache.set(key.clone(), CacheValue::Profile(None)).await;
        cache.invalidate(&key).await;

        let value = cache.refetch(key.clone(), &FixedLoader).await.unwrap();
        assert!(matches!(value, CacheValue::Profile(Some(_))));
        let entry = cache.get(&key).await.unwrap();
        assert!(!entry.stale);

        assert!(cache.refetch(CacheKey::Tasks(alice()), &FixedLoader).await.is_err());
    }
}
