//! Statement-text cache.
//!
//! Generated SQL depends only on the query's shape (target type, criteria
//! properties and operators, operand nullness and list lengths, sort parts,
//! paging kind), never on bound values. Text is cached per shape so that a
//! repeated shape skips string building.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CachedStatement {
    sql: Arc<str>,
    last_used: u64,
    hits: u64,
}

/// LRU cache of SQL text keyed by a shape hash.
#[derive(Debug)]
pub struct StatementCache {
    entries: HashMap<u64, CachedStatement>,
    max_size: usize,
    clock: u64,
}

impl StatementCache {
    /// A cache holding at most `max_size` statements. Zero disables caching.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size.min(256)),
            max_size,
            clock: 0,
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<str>> {
        self.clock += 1;
        let now = self.clock;
        self.entries.get_mut(&key).map(|entry| {
            entry.last_used = now;
            entry.hits += 1;
            Arc::clone(&entry.sql)
        })
    }

    pub fn insert(&mut self, key: u64, sql: &str) -> Arc<str> {
        let sql: Arc<str> = Arc::from(sql);
        if self.max_size == 0 {
            return sql;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru();
        }
        self.clock += 1;
        self.entries.insert(
            key,
            CachedStatement {
                sql: Arc::clone(&sql),
                last_used: self.clock,
                hits: 0,
            },
        );
        sql
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Times the statement under `key` was served from the cache.
    pub fn hits(&self, key: u64) -> u64 {
        self.entries.get(&key).map_or(0, |e| e.hits)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) {
        if let Some(&oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key)
        {
            self.entries.remove(&oldest);
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Hash any shape description into a cache key.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
