use async_trait::async_trait;
use courier_rs_store::{MemoryStore, ScoredMember, SharedStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// [`MemoryStore`] wrapper whose index ranges can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_ranges: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `zrange_after` return `StoreError::Unavailable` while set.
    pub fn fail_ranges(&self, fail: bool) {
        self.fail_ranges.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.inner.hset(key, field, value).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.inner.hset_nx(key, field, value).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hgetall(key).await
    }

    async fn rpush_bounded(
        &self,
        key: &str,
        value: &str,
        bound: usize,
    ) -> Result<bool, StoreError> {
        self.inner.rpush_bounded(key, value, bound).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.lpop(key).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.llen(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        self.inner.zscore(key, member).await
    }

    async fn zrange_after(
        &self,
        key: &str,
        cursor: Option<&ScoredMember>,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        if self.fail_ranges.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected range failure".to_string()));
        }
        self.inner.zrange_after(key, cursor, limit).await
    }
}
