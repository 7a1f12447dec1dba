//! Property tests: partition invariants, cache budget, sampling determinism.

use std::collections::HashSet;
use std::sync::Arc;

use halograph::cache::FeatureCache;
use halograph::partition::PartitionManager;
use halograph::sample::{SampleRequest, SamplingEngine};
use halograph::store::GraphStore;
use proptest::prelude::*;

const FEATURE_DIM: usize = 4;

/// Build a store over `n` nodes from an arbitrary edge list (endpoints
/// taken modulo `n`, self loops dropped).
fn store_from_raw(n: usize, raw_edges: &[(u64, u64)]) -> Arc<GraphStore> {
    let edges: Vec<(u64, u64)> = raw_edges
        .iter()
        .map(|&(a, b)| (a % n as u64, b % n as u64))
        .filter(|&(a, b)| a != b)
        .collect();
    let features = vec![1.0f32; n * FEATURE_DIM];
    Arc::new(GraphStore::from_edges(n, &edges, true, features, FEATURE_DIM, None).unwrap())
}

proptest! {
    /// Every node lands in exactly one partition and member lists are
    /// disjoint, regardless of graph shape and worker count.
    #[test]
    fn partition_covers_all_nodes_exactly_once(
        n in 1usize..200,
        raw_edges in prop::collection::vec((0u64..1000, 0u64..1000), 0..400),
        num_workers in 1usize..8,
    ) {
        let store = store_from_raw(n, &raw_edges);
        let manager = PartitionManager::partition(store, num_workers, 0).unwrap();

        let mut seen: HashSet<u64> = HashSet::new();
        let mut total = 0usize;
        for w in 0..num_workers {
            let members = manager.members(w).unwrap();
            total += members.len();
            for &node in members {
                prop_assert!(seen.insert(node), "node {} in two partitions", node);
                prop_assert!(node < n as u64);
            }
        }
        prop_assert_eq!(total, n);
    }

    /// No partition exceeds the balance cap, and the greedy fallback
    /// placement cannot skew sizes beyond what coverage under the cap
    /// allows: with every partition at most `cap` and all `n` nodes
    /// covered, the smallest holds at least `n - (k-1)*cap`.
    #[test]
    fn partition_respects_balance_cap(
        n in 1usize..200,
        raw_edges in prop::collection::vec((0u64..1000, 0u64..1000), 0..400),
        num_workers in 1usize..8,
        tolerance in 0usize..5,
    ) {
        let store = store_from_raw(n, &raw_edges);
        let manager = PartitionManager::partition(store, num_workers, tolerance).unwrap();

        let cap = (n + num_workers - 1) / num_workers + tolerance;
        let sizes: Vec<usize> = (0..num_workers)
            .map(|w| manager.members(w).unwrap().len())
            .collect();
        for &s in &sizes {
            prop_assert!(s <= cap);
        }

        let max = *sizes.iter().max().unwrap();
        let min = *sizes.iter().min().unwrap();
        prop_assert!(
            max - min <= num_workers * cap - n,
            "skew {} exceeds worst case {} (cap {}, sizes {:?})",
            max - min, num_workers * cap - n, cap, sizes
        );
    }

    /// Identical inputs produce identical assignments.
    #[test]
    fn partition_is_deterministic(
        n in 1usize..100,
        raw_edges in prop::collection::vec((0u64..500, 0u64..500), 0..200),
        num_workers in 1usize..5,
    ) {
        let a = PartitionManager::partition(store_from_raw(n, &raw_edges), num_workers, 0).unwrap();
        let b = PartitionManager::partition(store_from_raw(n, &raw_edges), num_workers, 0).unwrap();
        for w in 0..num_workers {
            prop_assert_eq!(a.members(w).unwrap(), b.members(w).unwrap());
        }
    }

    /// Halo nodes are never owned by the worker they surround.
    #[test]
    fn halo_is_disjoint_from_partition(
        n in 2usize..150,
        raw_edges in prop::collection::vec((0u64..500, 0u64..500), 1..300),
        hops in 1usize..4,
    ) {
        let store = store_from_raw(n, &raw_edges);
        let manager = PartitionManager::partition(store, 2, 0).unwrap();

        let owned: HashSet<u64> = manager.members(0).unwrap().iter().copied().collect();
        for node in manager.compute_halo(0, hops).unwrap() {
            prop_assert!(!owned.contains(&node), "halo node {} is owned", node);
        }
    }

    /// The cache never holds more bytes than its budget, for any
    /// interleaving of puts over any payload population.
    #[test]
    fn cache_budget_holds_under_arbitrary_puts(
        budget_rows in 1usize..50,
        inserts in prop::collection::vec(0u64..500, 1..300),
    ) {
        let row = FEATURE_DIM * std::mem::size_of::<f32>();
        let cache = FeatureCache::new(budget_rows * row);
        let payload: Arc<[f32]> = vec![0.5f32; FEATURE_DIM].into();

        for &node in &inserts {
            cache.put(node, Arc::clone(&payload));
            prop_assert!(cache.used_bytes() <= budget_rows * row);
        }

        let stats = cache.stats();
        prop_assert!(stats.entries <= budget_rows);
    }

    /// Same request, same seed, same subgraph.
    #[test]
    fn sampling_is_deterministic(
        n in 2usize..100,
        raw_edges in prop::collection::vec((0u64..500, 0u64..500), 1..200),
        fanout in 1usize..6,
        num_hops in 1usize..4,
        seed in any::<u64>(),
    ) {
        let store = store_from_raw(n, &raw_edges);
        let engine = SamplingEngine::new(Arc::clone(&store));
        let request = SampleRequest {
            seeds: vec![0],
            fanout,
            num_hops,
            seed: Some(seed),
        };

        let a = engine.sample(&request, &FeatureCache::new(1 << 20)).unwrap();
        let b = engine.sample(&request, &FeatureCache::new(1 << 20)).unwrap();
        prop_assert_eq!(a.nodes, b.nodes);
        prop_assert_eq!(a.edges, b.edges);
    }

    /// Fanout bounds the per-node expansion at every hop.
    #[test]
    fn sampling_respects_fanout(
        n in 2usize..100,
        raw_edges in prop::collection::vec((0u64..500, 0u64..500), 1..200),
        fanout in 1usize..5,
    ) {
        let store = store_from_raw(n, &raw_edges);
        let engine = SamplingEngine::new(Arc::clone(&store));
        let result = engine
            .sample(
                &SampleRequest { seeds: vec![0], fanout, num_hops: 3, seed: Some(1) },
                &FeatureCache::new(1 << 20),
            )
            .unwrap();

        let mut out_count: std::collections::HashMap<u64, usize> = std::collections::HashMap::new();
        for &(src, _) in &result.edges {
            *out_count.entry(src).or_default() += 1;
        }
        for (&node, &count) in &out_count {
            prop_assert!(count <= fanout, "node {} expanded {} > fanout {}", node, count, fanout);
        }
    }
}
