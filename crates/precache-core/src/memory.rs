use crate::error::Result;
use crate::request::RequestKey;
use crate::traits::{Cache, CacheStats, CacheStorage, ResponseSnapshot};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of shards per generation. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard = RwLock<HashMap<RequestKey, ResponseSnapshot>>;

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// In-memory cache storage.
///
/// Each generation spreads its keys over 64 shards, each behind its own
/// `RwLock`, so concurrent fetch events for different URLs rarely contend.
/// A `put` swaps the whole snapshot under the shard's write lock, which gives
/// per-key atomicity and nothing more.
#[derive(Default)]
pub struct MemoryStorage {
    generations: RwLock<HashMap<String, Arc<MemoryCache>>>,
    counters: Arc<Counters>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, generation: &str) -> Result<Arc<dyn Cache>> {
        if let Some(existing) = self.generations.read().get(generation) {
            return Ok(Arc::clone(existing) as Arc<dyn Cache>);
        }

        let mut generations = self.generations.write();
        let cache = generations
            .entry(generation.to_string())
            .or_insert_with(|| {
                tracing::debug!(generation, "cache generation created");
                Arc::new(MemoryCache::new(generation, Arc::clone(&self.counters)))
            });
        Ok(Arc::clone(cache) as Arc<dyn Cache>)
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        Ok(self.generations.read().contains_key(generation))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.generations.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        Ok(self.generations.write().remove(generation).is_some())
    }

    fn stats(&self) -> Option<CacheStats> {
        let generations = self.generations.read();
        Some(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            entries: generations.values().map(|g| g.len()).sum(),
            generations: generations.len(),
        })
    }
}

/// One in-memory generation.
pub struct MemoryCache {
    name: String,
    shards: Box<[Shard; NUM_SHARDS]>,
    counters: Arc<Counters>,
}

impl MemoryCache {
    fn new(name: &str, counters: Arc<Counters>) -> Self {
        let shards: Vec<Shard> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        let shards: Box<[Shard; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self {
            name: name.to_string(),
            shards,
            counters,
        }
    }

    #[inline]
    fn shard(&self, key: &RequestKey) -> &Shard {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    /// Number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    fn insert(&self, key: RequestKey, response: ResponseSnapshot) {
        self.shard(&key).write().insert(key, response);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn generation(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
        let found = self.shard(key).read().get(key).map(ResponseSnapshot::copy);
        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn put(&self, key: RequestKey, response: ResponseSnapshot) -> Result<()> {
        self.insert(key, response);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(RequestKey, ResponseSnapshot)>) -> Result<()> {
        for (key, response) in entries {
            self.insert(key, response);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        let mut keys: Vec<RequestKey> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
