//! LRU result cache with an entry limit and a byte budget
//!
//! Entries live in a slot vector threaded into a doubly linked recency list
//! (head = most recently used). Every `get` promotes the entry, so the tail
//! is always the eviction candidate. Both limits hold after every call:
//! `len() <= max_entries` and `total_bytes() <= max_bytes`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::key::CacheKey;
use crate::payload::Payload;
use crate::registry::ModelId;

/// A cached inference result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub output: Payload,
    pub confidence: f32,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn new(output: Payload, confidence: f32) -> Self {
        Self {
            output,
            confidence,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Estimates how many bytes a cached payload occupies
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, payload: &Payload) -> u64;
}

/// Default estimator: exact sizes for buffers, a fixed figure for structured values
#[derive(Debug, Clone, Copy)]
pub struct PayloadSizeEstimator {
    /// Bytes charged for payloads without a meaningful buffer size
    pub opaque_estimate: u64,
}

impl Default for PayloadSizeEstimator {
    fn default() -> Self {
        Self { opaque_estimate: 100 }
    }
}

impl SizeEstimator for PayloadSizeEstimator {
    fn estimate(&self, payload: &Payload) -> u64 {
        match payload {
            Payload::Floats(values) => values.len() as u64 * 4,
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::Text(text) => text.len() as u64,
            Payload::Structured(_) => self.opaque_estimate,
        }
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

struct Node {
    key: CacheKey,
    entry: CacheEntry,
    bytes: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct LruState {
    index: HashMap<CacheKey, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_entries: usize,
    max_bytes: u64,
    total_bytes: u64,
    evictions: u64,
}

impl LruState {
    fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            index: HashMap::with_capacity(max_entries.min(1024)),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_entries,
            max_bytes,
            total_bytes: 0,
            evictions: 0,
        }
    }

    fn node(&self, idx: usize) -> Option<&Node> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn insert_front(&mut self, key: CacheKey, entry: CacheEntry, bytes: u64) {
        let node = Node {
            key: key.clone(),
            entry,
            bytes,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.index.insert(key, idx);
        self.total_bytes += bytes;
    }

    fn remove_slot(&mut self, idx: usize) -> Option<Node> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.index.remove(&node.key);
        self.total_bytes -= node.bytes;
        Some(node)
    }

    fn evict_oldest(&mut self) -> bool {
        match self.tail {
            Some(idx) => {
                let evicted = self.remove_slot(idx).is_some();
                if evicted {
                    self.evictions += 1;
                }
                evicted
            }
            None => false,
        }
    }

    fn enforce_limits(&mut self) {
        while self.index.len() > self.max_entries && self.evict_oldest() {}
        while self.total_bytes > self.max_bytes && self.evict_oldest() {}
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_bytes = 0;
    }
}

/// Thread-safe LRU cache of inference results
pub struct ResultCache {
    state: RwLock<LruState>,
    estimator: Arc<dyn SizeEstimator>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create a cache with the default size estimator
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self::with_estimator(max_entries, max_bytes, Arc::new(PayloadSizeEstimator::default()))
    }

    pub fn with_estimator(
        max_entries: usize,
        max_bytes: u64,
        estimator: Arc<dyn SizeEstimator>,
    ) -> Self {
        Self {
            state: RwLock::new(LruState::new(max_entries, max_bytes)),
            estimator,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.write();
        match state.index.get(key).copied() {
            Some(idx) => {
                state.unlink(idx);
                state.push_front(idx);
                self.hits.fetch_add(1, Ordering::Relaxed);
                state.node(idx).map(|node| node.entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry. Returns false when the entry alone exceeds
    /// the byte budget and was not stored.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> bool {
        let bytes = self.estimator.estimate(&entry.output);
        let mut state = self.state.write();

        if let Some(idx) = state.index.get(&key).copied() {
            state.remove_slot(idx);
        }

        if bytes > state.max_bytes || state.max_entries == 0 {
            debug!(bytes, max_bytes = state.max_bytes, "Entry exceeds cache budget, not cached");
            return false;
        }

        while state.total_bytes + bytes > state.max_bytes && state.evict_oldest() {}
        while state.index.len() >= state.max_entries && state.evict_oldest() {}

        state.insert_front(key, entry, bytes);
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.read().index.contains_key(key)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.write();
        let idx = state.index.get(key).copied()?;
        state.remove_slot(idx).map(|node| node.entry)
    }

    /// Drop every entry belonging to a model
    pub fn invalidate_model(&self, model_id: &ModelId) -> usize {
        let mut state = self.state.write();
        let doomed: Vec<usize> = state
            .index
            .iter()
            .filter(|(key, _)| key.model_id() == model_id)
            .map(|(_, &idx)| idx)
            .collect();
        for &idx in &doomed {
            state.remove_slot(idx);
        }
        doomed.len()
    }

    /// Apply new limits, evicting oldest entries until both hold
    pub fn resize(&self, max_entries: usize, max_bytes: u64) {
        let mut state = self.state.write();
        state.max_entries = max_entries;
        state.max_bytes = max_bytes;
        state.enforce_limits();
    }

    pub fn clear(&self) {
        self.state.write().clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.read().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: state.index.len(),
            total_bytes: state.total_bytes,
            max_entries: state.max_entries,
            max_bytes: state.max_bytes,
            hits,
            misses,
            evictions: state.evictions,
            hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> CacheKey {
        CacheKey::new(ModelId::from("m"), &Payload::from(vec![i as f32]))
    }

    fn floats(n: usize) -> CacheEntry {
        CacheEntry::new(Payload::from(vec![1.0_f32; n]), 1.0)
    }

    #[test]
    fn test_cache_basic() {
        let cache = ResultCache::new(3, 1024);
        cache.put(key(1), floats(1));
        cache.put(key(2), floats(1));

        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(3)).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 8);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::new(3, 1024);
        cache.put(key(1), floats(1));
        cache.put(key(2), floats(1));
        cache.put(key(3), floats(1));
        cache.put(key(4), floats(1));

        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(cache.contains(&key(4)));
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = ResultCache::new(3, 1024);
        cache.put(key(1), floats(1));
        cache.put(key(2), floats(1));
        cache.put(key(3), floats(1));

        cache.get(&key(1));
        cache.put(key(4), floats(1));

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
    }

    #[test]
    fn test_byte_budget_evicts_several() {
        let cache = ResultCache::new(10, 40);
        for i in 0..4 {
            cache.put(key(i), floats(2)); // 8 bytes each
        }
        assert_eq!(cache.total_bytes(), 32);

        // 32 bytes needs three evictions to fit beside the 8 remaining
        cache.put(key(9), floats(8));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key(3)));
        assert!(cache.contains(&key(9)));
        assert!(cache.total_bytes() <= 40);
    }

    #[test]
    fn test_oversized_entry_not_stored() {
        let cache = ResultCache::new(10, 16);
        cache.put(key(1), floats(2));
        assert!(!cache.put(key(2), floats(100)));
        assert!(cache.contains(&key(1)));
        assert_eq!(cache.total_bytes(), 8);
    }

    #[test]
    fn test_replace_updates_bytes() {
        let cache = ResultCache::new(10, 1024);
        cache.put(key(1), floats(4));
        cache.put(key(1), floats(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 4);
    }

    #[test]
    fn test_resize_shrinks() {
        let cache = ResultCache::new(10, 1024);
        for i in 0..6 {
            cache.put(key(i), floats(4));
        }
        cache.resize(4, 32);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key(4)));
        assert!(cache.contains(&key(5)));
        assert!(cache.total_bytes() <= 32);
    }

    #[test]
    fn test_clear_resets_bytes() {
        let cache = ResultCache::new(10, 1024);
        cache.put(key(1), floats(4));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        cache.put(key(2), floats(1));
        assert_eq!(cache.total_bytes(), 4);
    }

    #[test]
    fn test_invalidate_model() {
        let cache = ResultCache::new(10, 1024);
        let other = CacheKey::new(ModelId::from("other"), &Payload::from(vec![1.0_f32]));
        cache.put(key(1), floats(1));
        cache.put(key(2), floats(1));
        cache.put(other.clone(), floats(1));

        assert_eq!(cache.invalidate_model(&ModelId::from("m")), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&other));
    }

    #[test]
    fn test_opaque_estimate_is_pluggable() {
        struct Flat;
        impl SizeEstimator for Flat {
            fn estimate(&self, _payload: &Payload) -> u64 {
                10
            }
        }
        let cache = ResultCache::with_estimator(10, 25, Arc::new(Flat));
        cache.put(key(1), floats(1000));
        cache.put(key(2), floats(1000));
        cache.put(key(3), floats(1000));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 20);

        let structured = Payload::from(serde_json::json!({"boxes": []}));
        assert_eq!(PayloadSizeEstimator::default().estimate(&structured), 100);
    }
}
