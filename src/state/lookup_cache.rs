use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use super::ServerIndex;
use crate::error::{NamingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

/// Bounded most-recently-used map from path to owning server.
///
/// Entries are hints: a miss always falls back to the path index, and the
/// owner of a cached path is never rewritten in place. Callers that need to
/// change a mapping delete it first.
pub struct LookupCache {
    entries: LruCache<String, ServerIndex>,
    hits: u64,
    misses: u64,
}

impl LookupCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| NamingError::Config("cache capacity must be at least 1".to_string()))?;
        Ok(Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    /// Look up `path`, marking it most recently used on a hit.
    pub fn get(&mut self, path: &str) -> Option<ServerIndex> {
        match self.entries.get(path) {
            Some(server) => {
                self.hits += 1;
                Some(*server)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `path` at the front, evicting the least recently used entry
    /// when full. An existing entry is only promoted; its owner is kept.
    pub fn put(&mut self, path: &str, server: ServerIndex) {
        if self.entries.contains(path) {
            self.entries.promote(path);
            return;
        }
        if let Some((evicted, _)) = self.entries.push(path.to_string(), server) {
            debug!("Evicted {} from lookup cache", evicted);
        }
    }

    pub fn delete(&mut self, path: &str) -> Option<ServerIndex> {
        self.entries.pop(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Cached entries from most to least recently used.
    pub fn entries(&self) -> Vec<(String, ServerIndex)> {
        self.entries
            .iter()
            .map(|(path, server)| (path.clone(), *server))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.entries.len(),
            capacity: self.capacity(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
