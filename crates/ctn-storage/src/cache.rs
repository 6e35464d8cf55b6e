//! In-memory LRU of small decoded blobs

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::key::BlobKey;

pub const DEFAULT_CACHE_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CACHE_ITEM_MAX_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct HotCache {
    max_bytes: u64,
    item_max_bytes: u64,
    state: Mutex<CacheState>,
}

#[derive(Debug)]
struct Entry {
    data: Bytes,
    used: u64,
}

/// Each entry carries the tick of its last use; `order` indexes entries by
/// tick, so the least recently used is always the first key.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BlobKey, Entry>,
    order: BTreeMap<u64, BlobKey>,
    tick: u64,
    bytes: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &BlobKey) -> Option<Bytes> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        if let Some(k) = self.order.remove(&entry.used) {
            self.order.insert(tick, k);
        }
        entry.used = tick;
        Some(entry.data.clone())
    }

    fn evict(&mut self, key: &BlobKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.bytes -= entry.data.len() as u64;
                self.order.remove(&entry.used);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.order.pop_first() {
            Some((_, oldest)) => {
                if let Some(old) = self.entries.remove(&oldest) {
                    self.bytes -= old.data.len() as u64;
                }
                true
            }
            None => false,
        }
    }

    fn push(&mut self, key: BlobKey, data: Bytes) {
        let used = self.next_tick();
        self.bytes += data.len() as u64;
        self.order.insert(used, key.clone());
        self.entries.insert(key, Entry { data, used });
    }
}

impl HotCache {
    pub fn new(max_bytes: u64, item_max_bytes: u64) -> Self {
        Self {
            max_bytes,
            item_max_bytes: item_max_bytes.min(max_bytes),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Largest blob the cache will admit.
    pub fn item_max_bytes(&self) -> u64 {
        self.item_max_bytes
    }

    pub fn get(&self, key: &BlobKey) -> Option<Bytes> {
        self.state.lock().get(key)
    }

    /// Admit `data`, evicting older entries as needed. Oversized items are
    /// refused.
    pub fn insert(&self, key: BlobKey, data: Bytes) -> bool {
        let len = data.len() as u64;
        if len > self.item_max_bytes {
            return false;
        }
        let mut state = self.state.lock();
        state.evict(&key);
        while state.bytes + len > self.max_bytes && state.evict_oldest() {}
        state.push(key, data);
        true
    }

    pub fn remove(&self, key: &BlobKey) -> bool {
        self.state.lock().evict(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held.
    pub fn size(&self) -> u64 {
        self.state.lock().bytes
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_BYTES, DEFAULT_CACHE_ITEM_MAX_BYTES)
    }
}
