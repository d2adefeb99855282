//! Query cache decorator that records the order of operations

use fieldtask_boot::{CacheEntry, CacheKey, CacheValue, EntryLoader, QueryCache};
use fieldtask_model::Failure;
use parking_lot::Mutex;

/// A recorded cache operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Get(CacheKey),
    Set(CacheKey),
    Invalidate(CacheKey),
    InvalidateMatching,
    Evict(CacheKey),
    Clear,
    Refetch(CacheKey),
}

/// Wraps a [`QueryCache`] and logs every call
#[derive(Debug, Default)]
pub struct RecordingCache<C> {
    inner: C,
    ops: Mutex<Vec<CacheOp>>,
}

impl<C> RecordingCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn ops(&self) -> Vec<CacheOp> {
        self.ops.lock().clone()
    }

    pub fn reset_ops(&self) {
        self.ops.lock().clear();
    }

    /// Index of the first recorded op matching `predicate`
    pub fn position(&self, predicate: impl Fn(&CacheOp) -> bool) -> Option<usize> {
        self.ops.lock().iter().position(predicate)
    }

    fn record(&self, op: CacheOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait::async_trait]
impl<C: QueryCache> QueryCache for RecordingCache<C> {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.record(CacheOp::Get(key.clone()));
        self.inner.get(key).await
    }

    async fn set(&self, key: CacheKey, value: CacheValue) {
        self.record(CacheOp::Set(key.clone()));
        self.inner.set(key, value).await;
    }

    async fn invalidate(&self, key: &CacheKey) {
        self.record(CacheOp::Invalidate(key.clone()));
        self.inner.invalidate(key).await;
    }

    async fn invalidate_matching(&self, predicate: &(dyn for<'k> Fn(&'k CacheKey) -> bool + Send + Sync)) -> usize {
        self.record(CacheOp::InvalidateMatching);
        self.inner.invalidate_matching(predicate).await
    }

    async fn evict(&self, key: &CacheKey) {
        self.record(CacheOp::Evict(key.clone()));
        self.inner.evict(key).await;
    }

    async fn clear(&self) {
        self.record(CacheOp::Clear);
        self.inner.clear().await;
    }

    async fn refetch(&self, key: CacheKey, loader: &dyn EntryLoader) -> Result<CacheValue, Failure> {
        self.record(CacheOp::Refetch(key.clone()));
        self.inner.refetch(key, loader).await
    }
}
