//! Capability interface over the shared key-value store.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;

/// One entry of an ordered index, ordered by `(score, member)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScoredMember {
    pub score: i64,
    pub member: String,
}

impl ScoredMember {
    pub fn new(score: i64, member: impl Into<String>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

#[async_trait]
/// Primitive operations every node relies on for cross-node state.
///
/// Implementations must make each call atomic on its own; callers never
/// assume multi-call transactions.
pub trait SharedStore: Send + Sync {
    /// Read a scalar value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a scalar value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Read one field of a record.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Write one field of a record. Returns whether the field was new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    /// Write a field only when it is absent. Returns whether it was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Read every field of a record; empty when the record does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Append to a list only while its length is below `bound`.
    ///
    /// Returns `false` and leaves the list unchanged when it is full.
    async fn rpush_bounded(&self, key: &str, value: &str, bound: usize)
    -> Result<bool, StoreError>;

    /// Remove and return the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Add or rescore a member of an ordered index. Returns whether it was new.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError>;

    /// Page an ordered index: up to `limit` entries strictly after `cursor`.
    ///
    /// Keyset paging stays stable when entries before the cursor are removed
    /// between calls.
    async fn zrange_after(
        &self,
        key: &str,
        cursor: Option<&ScoredMember>,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;
}
