//! Neighborhood sampling for minibatch construction.
//!
//! Layer-by-layer fanout sampling: each hop expands the current frontier
//! by up to `fanout` uniformly chosen neighbors per node, without
//! replacement and without padding. The RNG is seeded per request, never
//! ambient, so a request replays to the identical subgraph.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cache::FeatureCache;
use crate::error::{GraphError, Result};
use crate::store::GraphStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRequest {
    pub seeds: Vec<u64>,
    pub fanout: usize,
    pub num_hops: usize,
    /// Explicit RNG seed; absent means seed 0.
    pub seed: Option<u64>,
}

/// Where a node's feature payload came from when the result was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    Cached,
    Fetched,
}

/// Induced subgraph over the sampled neighborhood.
///
/// `nodes` is deduplicated and layer-ordered (seeds first, then each
/// hop's newly selected neighbors); `features` and `provenance` are
/// parallel to it. `edges` holds every sampled `(frontier, neighbor)`
/// pair, so multi-hop structure is reconstructible per seed path.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub nodes: Vec<u64>,
    pub edges: Vec<(u64, u64)>,
    pub features: Vec<Arc<[f32]>>,
    pub provenance: Vec<Provenance>,
    pub seed: u64,
}

impl SampleResult {
    pub fn cache_hits(&self) -> usize {
        self.provenance
            .iter()
            .filter(|p| **p == Provenance::Cached)
            .count()
    }
}

/// Stateless sampler over the immutable store.
pub struct SamplingEngine {
    store: Arc<GraphStore>,
}

impl SamplingEngine {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    /// Run one sampling request, resolving features through `cache`.
    ///
    /// Misses are fetched from the store and inserted into the cache as
    /// a side effect; the result records hit/miss provenance per node.
    pub fn sample(&self, request: &SampleRequest, cache: &FeatureCache) -> Result<SampleResult> {
        if request.fanout == 0 {
            return Err(GraphError::Configuration("fanout must be positive".into()));
        }
        if request.num_hops == 0 {
            return Err(GraphError::Configuration("num_hops must be positive".into()));
        }
        for &seed in &request.seeds {
            self.store.check_node(seed)?;
        }

        let rng_seed = request.seed.unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(rng_seed);

        let mut visited: HashSet<u64> = HashSet::new();
        let mut nodes: Vec<u64> = Vec::new();
        let mut frontier: Vec<u64> = Vec::new();
        for &seed in &request.seeds {
            if visited.insert(seed) {
                nodes.push(seed);
                frontier.push(seed);
            }
        }

        let mut edges: Vec<(u64, u64)> = Vec::new();
        for _ in 0..request.num_hops {
            let mut next: Vec<u64> = Vec::new();
            for &node in &frontier {
                let neighbors = self.store.neighbors(node);
                let selected = sample_neighbors(neighbors, request.fanout, &mut rng);
                for nb in selected {
                    edges.push((node, nb));
                    if visited.insert(nb) {
                        nodes.push(nb);
                        next.push(nb);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let (features, provenance) = resolve_features(&self.store, cache, &nodes)?;

        Ok(SampleResult {
            nodes,
            edges,
            features,
            provenance,
            seed: rng_seed,
        })
    }
}

/// Resolve feature payloads for `nodes` in order: cache hit, or store
/// fetch followed by a cache insert. Shared by SAMPLE and GET_FEATURES.
pub fn resolve_features(
    store: &GraphStore,
    cache: &FeatureCache,
    nodes: &[u64],
) -> Result<(Vec<Arc<[f32]>>, Vec<Provenance>)> {
    let mut features = Vec::with_capacity(nodes.len());
    let mut provenance = Vec::with_capacity(nodes.len());
    for &node in nodes {
        match cache.get(node) {
            Some(payload) => {
                features.push(payload);
                provenance.push(Provenance::Cached);
            }
            None => {
                let payload = store.feature(node)?;
                cache.put(node, Arc::clone(&payload));
                features.push(payload);
                provenance.push(Provenance::Fetched);
            }
        }
    }
    Ok((features, provenance))
}

/// Up to `fanout` neighbors, uniform without replacement. A node with
/// degree below the fanout yields its full neighbor list — no padding,
/// no duplication.
fn sample_neighbors(neighbors: &[u64], fanout: usize, rng: &mut StdRng) -> Vec<u64> {
    if neighbors.len() <= fanout {
        return neighbors.to_vec();
    }
    rand::seq::index::sample(rng, neighbors.len(), fanout)
        .into_iter()
        .map(|i| neighbors[i])
        .collect()
}
