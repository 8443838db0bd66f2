//! Bounded, expiring cache of query embeddings.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RetrievalConfig;

struct Entry {
    embedding: Vec<f32>,
    inserted_at: Instant,
}

/// LRU cache keyed by query text. Entries older than `ttl` are treated as
/// missing and evicted on lookup.
pub struct EmbeddingCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl EmbeddingCache {
    /// A zero `max_entries` is raised to 1.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Sized from `[retrieval] embedding_cache_size` / `embedding_cache_ttl_secs`.
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(
            config.embedding_cache_size,
            Duration::from_secs(config.embedding_cache_ttl_secs),
        )
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        // A poisoned cache only costs a recomputation.
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(query) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                return Some(entry.embedding.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(query);
        }
        None
    }

    pub fn insert(&self, query: &str, embedding: Vec<f32>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                query.to_string(),
                Entry {
                    embedding,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
