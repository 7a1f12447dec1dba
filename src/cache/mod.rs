//! Per-worker bounded feature cache.
//!
//! Entries are sharded by node-id hash with one mutex per shard, so
//! concurrent traffic for different nodes rarely contends. Byte
//! accounting is global (an atomic), and eviction picks the entry with
//! the lowest `access_count / (now - last_access + 1)` score — keep what
//! is touched often *and* recently. Time is a per-cache logical tick,
//! not wall clock, which makes eviction order reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::GraphStore;

/// Default shard count exponent: 16 shards.
pub const DEFAULT_SHARD_BITS: u8 = 4;

struct Entry {
    payload: Arc<[f32]>,
    access_count: u64,
    last_access: u64,
    size: usize,
}

/// Point-in-time cache counters, exposed through server stats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded, sharded node-feature cache. One instance per worker.
pub struct FeatureCache {
    shards: Vec<Mutex<HashMap<u64, Entry>>>,
    shard_mask: u64,
    budget: usize,
    used: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FeatureCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self::with_shards(budget_bytes, DEFAULT_SHARD_BITS)
    }

    pub fn with_shards(budget_bytes: usize, shard_bits: u8) -> Self {
        let count = 1usize << shard_bits;
        let shards = (0..count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            shard_mask: count as u64 - 1,
            budget: budget_bytes,
            used: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    fn shard_for(&self, node: u64) -> &Mutex<HashMap<u64, Entry>> {
        // Splitmix-style finalizer spreads dense sequential ids
        let mut h = node.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= h >> 32;
        &self.shards[(h & self.shard_mask) as usize]
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a node's payload. A hit refreshes recency/frequency
    /// metadata; a miss only counts.
    pub fn get(&self, node: u64) -> Option<Arc<[f32]>> {
        let now = self.tick();
        let mut shard = self.shard_for(node).lock().unwrap();
        match shard.get_mut(&node) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.payload))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Membership probe that does not disturb entry metadata or
    /// hit/miss counters.
    pub fn contains(&self, node: u64) -> bool {
        self.shard_for(node).lock().unwrap().contains_key(&node)
    }

    /// Insert or refresh a node's payload, evicting lowest-score
    /// entries until the byte budget holds.
    ///
    /// A payload larger than the entire budget is never cached — the
    /// caller still has its copy to serve.
    pub fn put(&self, node: u64, payload: Arc<[f32]>) {
        let size = payload.len() * std::mem::size_of::<f32>();
        if size > self.budget {
            debug!(node, size, budget = self.budget, "payload exceeds budget, not cached");
            return;
        }

        let now = self.tick();
        {
            let mut shard = self.shard_for(node).lock().unwrap();
            if let Some(entry) = shard.get_mut(&node) {
                // Features are immutable; refresh metadata only.
                entry.access_count += 1;
                entry.last_access = now;
                return;
            }
            shard.insert(
                node,
                Entry {
                    payload,
                    access_count: 1,
                    last_access: now,
                    size,
                },
            );
            self.used.fetch_add(size, Ordering::AcqRel);
        }

        while self.used.load(Ordering::Acquire) > self.budget {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Remove the entry with the lowest frequency/recency score.
    /// Ties resolve to the lowest node id. Returns false when empty.
    fn evict_one(&self) -> bool {
        let now = self.clock.load(Ordering::Relaxed);
        let mut victim: Option<(f64, u64)> = None;

        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for (&node, entry) in shard.iter() {
                let age = now.saturating_sub(entry.last_access) + 1;
                let score = entry.access_count as f64 / age as f64;
                victim = match victim {
                    None => Some((score, node)),
                    Some((best, best_node)) => {
                        if score < best || (score == best && node < best_node) {
                            Some((score, node))
                        } else {
                            Some((best, best_node))
                        }
                    }
                };
            }
        }

        match victim {
            Some((_, node)) => {
                let mut shard = self.shard_for(node).lock().unwrap();
                if let Some(entry) = shard.remove(&node) {
                    self.used.fetch_sub(entry.size, Ordering::AcqRel);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Pre-fill the cache with the highest-degree candidate nodes, up
    /// to `warm_fraction` of the budget. Candidates are a partition's
    /// owned nodes plus its halo — the nodes most likely to be
    /// resampled. Returns the number of warmed entries.
    pub fn prewarm(
        &self,
        store: &GraphStore,
        candidates: &[u64],
        warm_fraction: f64,
    ) -> Result<usize> {
        let target = (self.budget as f64 * warm_fraction.clamp(0.0, 1.0)) as usize;
        let row = store.feature_row_bytes();
        if row == 0 || target == 0 {
            return Ok(0);
        }

        let mut by_degree: Vec<u64> = candidates.to_vec();
        by_degree.par_sort_unstable_by(|&a, &b| {
            store
                .degree(b)
                .cmp(&store.degree(a))
                .then_with(|| a.cmp(&b))
        });

        store.advise_willneed();

        let mut warmed = 0usize;
        for &node in &by_degree {
            if self.used_bytes() + row > target {
                break;
            }
            if self.contains(node) {
                continue;
            }
            self.put(node, store.feature(node)?);
            warmed += 1;
        }

        info!(
            warmed,
            used_bytes = self.used_bytes(),
            target,
            "cache pre-warmed"
        );
        Ok(warmed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.shards.iter().map(|s| s.lock().unwrap().len()).sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            used_bytes: self.used_bytes(),
            budget_bytes: self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(dim: usize, fill: f32) -> Arc<[f32]> {
        vec![fill; dim].into()
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = FeatureCache::new(1024);
        assert!(cache.get(7).is_none());
        cache.put(7, payload(4, 1.5));
        let got = cache.get(7).expect("inserted entry must hit");
        assert_eq!(&got[..], &[1.5, 1.5, 1.5, 1.5]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_put_refresh_no_duplicate() {
        let cache = FeatureCache::new(1024);
        cache.put(1, payload(4, 1.0));
        let used = cache.used_bytes();
        cache.put(1, payload(4, 1.0));
        assert_eq!(cache.used_bytes(), used, "re-put must not duplicate storage");
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_budget_never_exceeded() {
        // 4 floats per entry = 16 bytes; budget holds 4 entries
        let cache = FeatureCache::new(64);
        for node in 0..50u64 {
            cache.put(node, payload(4, node as f32));
            assert!(
                cache.used_bytes() <= 64,
                "budget exceeded after put({})",
                node
            );
        }
    }

    #[test]
    fn test_101_inserts_one_eviction_of_coldest() {
        // Scenario: budget holds exactly 100 entries; the 101st insert
        // evicts exactly one entry, the lowest-score (oldest) one.
        let dim = 4;
        let row = dim * 4;
        let cache = FeatureCache::new(100 * row);

        for node in 0..101u64 {
            cache.put(node, payload(dim, node as f32));
        }

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 100);
        // All entries had access_count 1, so the stalest insert
        // (node 0) scored lowest.
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(100));
    }

    #[test]
    fn test_hot_entry_survives_eviction() {
        let dim = 4;
        let row = dim * 4;
        let cache = FeatureCache::new(4 * row);
        for node in 0..4u64 {
            cache.put(node, payload(dim, 0.0));
        }
        // Touch node 0 repeatedly so its frequency dominates its age
        for _ in 0..10 {
            cache.get(0);
        }
        cache.put(99, payload(dim, 0.0));

        assert!(cache.contains(0), "hot entry must not be the victim");
        assert!(!cache.contains(1), "coldest untouched entry evicted");
    }

    #[test]
    fn test_oversized_payload_not_cached() {
        let cache = FeatureCache::new(8);
        cache.put(3, payload(16, 0.0)); // 64 bytes > 8 budget
        assert!(!cache.contains(3));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_prewarm_prefers_high_degree() {
        let edges = vec![(0u64, 1u64), (0, 2), (0, 3), (1, 2)];
        let store =
            GraphStore::from_edges(5, &edges, true, vec![0.0; 5 * 2], 2, None).unwrap();
        // Room for 2 rows at full budget, warm the whole budget
        let cache = FeatureCache::new(2 * store.feature_row_bytes());
        let warmed = cache
            .prewarm(&store, &[0, 1, 2, 3, 4], 1.0)
            .unwrap();

        assert_eq!(warmed, 2);
        assert!(cache.contains(0), "degree-3 node warmed first");
        assert!(cache.contains(1), "degree-2 node (lowest id tie) warmed second");
        assert!(!cache.contains(4), "isolated node never warmed");
    }

    #[test]
    fn test_prewarm_respects_fraction() {
        let store =
            GraphStore::from_edges(10, &[(0, 1)], true, vec![0.0; 10 * 4], 4, None).unwrap();
        let row = store.feature_row_bytes();
        let cache = FeatureCache::new(10 * row);
        let all: Vec<u64> = (0..10).collect();
        cache.prewarm(&store, &all, 0.5).unwrap();
        assert!(cache.used_bytes() <= 5 * row);
    }

    #[test]
    fn test_concurrent_puts_hold_budget() {
        use std::thread;

        let cache = Arc::new(FeatureCache::new(32 * 16));
        let mut handles = vec![];
        for t in 0..8u64 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..200u64 {
                    let node = t * 1000 + i;
                    cache.put(node, vec![0.0f32; 4].into());
                    cache.get(node % 64);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.used_bytes() <= 32 * 16);
    }
}
