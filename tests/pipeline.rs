//! Integration test: full serving pipeline.
//!
//! Exercises the whole path a server startup takes: build a dataset on
//! disk, load it back, partition it, pre-warm per-worker caches, then
//! sample minibatches and check hit rates and payload correctness.

use std::sync::Arc;

use halograph::cache::FeatureCache;
use halograph::partition::PartitionManager;
use halograph::sample::{Provenance, SampleRequest, SamplingEngine};
use halograph::store::{dataset, GraphStore};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const FEATURE_DIM: usize = 8;

/// Ring of `n` nodes with chords every 7th node. Feature row i is filled
/// with i as f32, so payloads are checkable after any number of copies.
fn build_store(n: usize) -> GraphStore {
    let mut edges: Vec<(u64, u64)> = (0..n as u64).map(|i| (i, (i + 1) % n as u64)).collect();
    for i in (0..n as u64).step_by(7) {
        edges.push((i, (i + n as u64 / 2) % n as u64));
    }
    let features: Vec<f32> = (0..n)
        .flat_map(|i| std::iter::repeat(i as f32).take(FEATURE_DIM))
        .collect();
    let labels: Vec<u64> = (0..n as u64).map(|i| i % 4).collect();
    GraphStore::from_edges(n, &edges, true, features, FEATURE_DIM, Some(labels)).unwrap()
}

fn row_bytes() -> usize {
    FEATURE_DIM * std::mem::size_of::<f32>()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn pipeline_load_partition_warm_sample() {
    let n = 1000;
    let num_workers = 4;

    // Write the dataset out and load it back through the mmap path
    let dir = TempDir::new().unwrap();
    let built = build_store(n);
    dataset::write_dataset(dir.path(), &built).unwrap();
    let store = Arc::new(dataset::load(dir.path()).unwrap());
    assert_eq!(store.num_nodes(), n);
    assert_eq!(store.feature_dim(), FEATURE_DIM);

    // Partition across workers
    let partitions = PartitionManager::partition(Arc::clone(&store), num_workers, 0).unwrap();
    let total: usize = (0..num_workers)
        .map(|w| partitions.members(w).unwrap().len())
        .sum();
    assert_eq!(total, n);

    // Warm one cache per worker with its partition plus halo
    let budget = 100 * row_bytes();
    let mut caches = Vec::new();
    for w in 0..num_workers {
        let cache = FeatureCache::new(budget);
        let mut candidates = partitions.members(w).unwrap().to_vec();
        candidates.extend(partitions.compute_halo(w, 1).unwrap());
        let warmed = cache.prewarm(&store, &candidates, 0.9).unwrap();
        assert!(warmed > 0, "worker {w} warmed nothing");
        assert!(cache.used_bytes() <= budget);
        caches.push(cache);
    }

    // Sample minibatches against each worker's cache
    let engine = SamplingEngine::new(Arc::clone(&store));
    for w in 0..num_workers {
        let seeds: Vec<u64> = partitions.members(w).unwrap().iter().take(16).copied().collect();
        let result = engine
            .sample(
                &SampleRequest {
                    seeds,
                    fanout: 3,
                    num_hops: 2,
                    seed: Some(w as u64),
                },
                &caches[w],
            )
            .unwrap();

        assert!(!result.nodes.is_empty());
        assert_eq!(result.nodes.len(), result.features.len());
        assert_eq!(result.nodes.len(), result.provenance.len());

        // Payloads must match the backing store exactly
        for (node, feat) in result.nodes.iter().zip(result.features.iter()) {
            assert_eq!(&feat[..], &store.feature(*node).unwrap()[..]);
        }

        // Budget holds after sampling pulled misses into the cache
        assert!(caches[w].used_bytes() <= budget);
    }
}

#[test]
fn pipeline_hit_rate_improves_with_warm_cache() {
    let n = 500;
    let store = Arc::new(build_store(n));
    let partitions = PartitionManager::partition(Arc::clone(&store), 2, 0).unwrap();
    let engine = SamplingEngine::new(Arc::clone(&store));

    let budget = n * row_bytes();
    let request = SampleRequest {
        seeds: partitions.members(0).unwrap().iter().take(32).copied().collect(),
        fanout: 4,
        num_hops: 2,
        seed: Some(77),
    };

    // Cold cache: everything fetched
    let cold = FeatureCache::new(budget);
    let first = engine.sample(&request, &cold).unwrap();
    assert!(first
        .provenance
        .iter()
        .all(|p| *p == Provenance::Fetched));

    // Warmed cache covering the whole partition and halo: all hits
    let warm = FeatureCache::new(budget);
    let mut candidates = partitions.members(0).unwrap().to_vec();
    candidates.extend(partitions.compute_halo(0, 2).unwrap());
    warm.prewarm(&store, &candidates, 1.0).unwrap();

    let second = engine.sample(&request, &warm).unwrap();
    assert_eq!(second.nodes, first.nodes);
    assert!(
        second.cache_hits() > first.cache_hits(),
        "warm cache should hit where cold fetched"
    );

    let stats = warm.stats();
    assert!(stats.hit_rate() > 0.0);
}

#[test]
fn pipeline_persisted_assignment_roundtrip() {
    let n = 200;
    let store = Arc::new(build_store(n));
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("assignment.bin");

    let original = PartitionManager::partition(Arc::clone(&store), 3, 2).unwrap();
    original.save(&path).unwrap();

    let restored = PartitionManager::load(&path, Arc::clone(&store), 3).unwrap();
    for w in 0..3 {
        assert_eq!(
            original.members(w).unwrap(),
            restored.members(w).unwrap(),
            "worker {w} members differ after reload"
        );
    }
    assert_eq!(original.edge_cut(), restored.edge_cut());
}

#[test]
fn pipeline_labels_survive_dataset_roundtrip() {
    let n = 64;
    let dir = TempDir::new().unwrap();
    let built = build_store(n);
    dataset::write_dataset(dir.path(), &built).unwrap();
    let loaded = dataset::load(dir.path()).unwrap();

    for i in 0..n as u64 {
        assert_eq!(loaded.label(i), Some(i % 4));
    }
}

#[test]
fn pipeline_eviction_under_tight_budget() {
    let n = 300;
    let store = Arc::new(build_store(n));
    let engine = SamplingEngine::new(Arc::clone(&store));

    // Room for only 20 rows; repeated sampling must evict, never overflow
    let budget = 20 * row_bytes();
    let cache = FeatureCache::new(budget);

    for round in 0..10u64 {
        let seeds: Vec<u64> = (round * 10..round * 10 + 10).collect();
        engine
            .sample(
                &SampleRequest {
                    seeds,
                    fanout: 2,
                    num_hops: 1,
                    seed: Some(round),
                },
                &cache,
            )
            .unwrap();
        assert!(cache.used_bytes() <= budget, "budget exceeded in round {round}");
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0, "tight budget must have evicted");
}
