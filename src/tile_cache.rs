//! Process-wide LRU cache for decoded raster chunks
//!
//! Point features cluster spatially, so consecutive 1x1 reads tend to land in
//! the same tile or strip. Caching the decoded bytes of each chunk turns a
//! run over N features into roughly one decompression per touched chunk
//! instead of one per feature.

use lru::LruCache;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

const CACHE_CAPACITY_BYTES: usize = 128 * 1024 * 1024;

#[derive(Clone, Eq, PartialEq)]
struct ChunkKey {
    source: Arc<str>,
    index: u32,
}

impl Hash for ChunkKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.index.hash(state);
    }
}

impl ChunkKey {
    fn new(source: &str, index: usize) -> Self {
        ChunkKey {
            source: Arc::from(source),
            index: index as u32,
        }
    }
}

struct CacheEntry {
    data: Arc<Vec<u8>>,
    size_bytes: usize,
}

struct ChunkCache {
    current_bytes: usize,
    capacity_bytes: usize,
    entries: LruCache<ChunkKey, CacheEntry>,
}

impl ChunkCache {
    fn new(capacity_bytes: usize) -> Self {
        ChunkCache {
            current_bytes: 0,
            capacity_bytes,
            entries: LruCache::unbounded(),
        }
    }

    fn get(&mut self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.data))
    }

    fn insert(&mut self, key: ChunkKey, data: Arc<Vec<u8>>) {
        let size_bytes = data.len();
        if size_bytes > self.capacity_bytes {
            return;
        }

        if let Some(old) = self.entries.pop(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.size_bytes);
        }

        while self.current_bytes + size_bytes > self.capacity_bytes {
            if let Some((_key, entry)) = self.entries.pop_lru() {
                self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
            } else {
                break;
            }
        }

        self.current_bytes = self.current_bytes.saturating_add(size_bytes);
        self.entries.put(key, CacheEntry { data, size_bytes });
    }
}

static CHUNK_CACHE: std::sync::LazyLock<Mutex<ChunkCache>> =
    std::sync::LazyLock::new(|| Mutex::new(ChunkCache::new(CACHE_CAPACITY_BYTES)));

pub fn get(source: &str, index: usize) -> Option<Arc<Vec<u8>>> {
    let key = ChunkKey::new(source, index);
    CHUNK_CACHE.lock().unwrap().get(&key)
}

pub fn insert(source: &str, index: usize, data: Arc<Vec<u8>>) {
    let key = ChunkKey::new(source, index);
    CHUNK_CACHE.lock().unwrap().insert(key, data);
}
