//! In-process implementation of [`SharedStore`].

use crate::error::StoreError;
use crate::store::{ScoredMember, SharedStore};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Bound;

#[derive(Debug, Default)]
struct OrderedIndex {
    entries: BTreeSet<ScoredMember>,
    scores: HashMap<String, i64>,
}

#[derive(Debug)]
enum Entry {
    Scalar(String),
    Record(HashMap<String, String>),
    List(VecDeque<String>),
    Ordered(OrderedIndex),
}

/// Mutex-guarded map of typed entries.
///
/// Collections are removed once empty so `exists` mirrors what a networked
/// key-value store reports. Cloning an `Arc<MemoryStore>` is how several
/// in-process nodes share one store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Sorted list of keys, for diagnostics and tests.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn record<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StoreError> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Record(HashMap::new()))
    {
        Entry::Record(map) => Ok(map),
        _ => Err(wrong_type(key, "record")),
    }
}

fn list<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(VecDeque::new()))
    {
        Entry::List(items) => Ok(items),
        _ => Err(wrong_type(key, "list")),
    }
}

fn ordered<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut OrderedIndex, StoreError> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Ordered(OrderedIndex::default()))
    {
        Entry::Ordered(index) => Ok(index),
        _ => Err(wrong_type(key, "ordered index")),
    }
}

/// Drop a collection entry that became empty.
fn prune(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key) {
        Some(Entry::Record(map)) => map.is_empty(),
        Some(Entry::List(items)) => items.is_empty(),
        Some(Entry::Ordered(index)) => index.entries.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.lock().get(key) {
            None => Ok(None),
            Some(Entry::Scalar(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key, "scalar")),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::Scalar(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            debug!("deleted key (key={})", key);
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self.entries.lock().get(key) {
            None => Ok(None),
            Some(Entry::Record(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "record")),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let map = record(&mut entries, key)?;
        Ok(map.insert(field.to_string(), value.to_string()).is_none())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let map = record(&mut entries, key)?;
        if map.contains_key(field) {
            return Ok(false);
        }
        map.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let removed = match entries.get_mut(key) {
            None => false,
            Some(Entry::Record(map)) => map.remove(field).is_some(),
            Some(_) => return Err(wrong_type(key, "record")),
        };
        prune(&mut entries, key);
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self.entries.lock().get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Record(map)) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key, "record")),
        }
    }

    async fn rpush_bounded(
        &self,
        key: &str,
        value: &str,
        bound: usize,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let items = list(&mut entries, key)?;
        let accepted = items.len() < bound;
        if accepted {
            items.push_back(value.to_string());
        }
        prune(&mut entries, key);
        Ok(accepted)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        let head = match entries.get_mut(key) {
            None => None,
            Some(Entry::List(items)) => items.pop_front(),
            Some(_) => return Err(wrong_type(key, "list")),
        };
        prune(&mut entries, key);
        Ok(head)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        match self.entries.lock().get(key) {
            None => Ok(0),
            Some(Entry::List(items)) => Ok(items.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let index = ordered(&mut entries, key)?;
        let previous = index.scores.insert(member.to_string(), score);
        if let Some(old) = previous {
            index.entries.remove(&ScoredMember::new(old, member));
        }
        index.entries.insert(ScoredMember::new(score, member));
        Ok(previous.is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let removed = match entries.get_mut(key) {
            None => false,
            Some(Entry::Ordered(index)) => match index.scores.remove(member) {
                Some(score) => index.entries.remove(&ScoredMember::new(score, member)),
                None => false,
            },
            Some(_) => return Err(wrong_type(key, "ordered index")),
        };
        prune(&mut entries, key);
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        match self.entries.lock().get(key) {
            None => Ok(None),
            Some(Entry::Ordered(index)) => Ok(index.scores.get(member).copied()),
            Some(_) => Err(wrong_type(key, "ordered index")),
        }
    }

    async fn zrange_after(
        &self,
        key: &str,
        cursor: Option<&ScoredMember>,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let entries = self.entries.lock();
        let index = match entries.get(key) {
            None => return Ok(Vec::new()),
            Some(Entry::Ordered(index)) => index,
            Some(_) => return Err(wrong_type(key, "ordered index")),
        };
        let lower = match cursor {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        Ok(index
            .entries
            .range((lower, Bound::Unbounded))
            .take(limit)
            .cloned()
            .collect())
    }
}
