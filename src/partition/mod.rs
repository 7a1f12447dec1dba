//! Graph partitioning: greedy streaming assignment + halo computation.
//!
//! Exact balanced min-cut partitioning is NP-hard; this module implements
//! the single-pass greedy heuristic: nodes are visited in descending
//! degree order and each goes to the partition already holding most of
//! its neighbors, subject to a hard per-partition size cap. The result is
//! deterministic for a given graph and worker count.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GraphError, Result};
use crate::store::GraphStore;

const UNASSIGNED: u32 = u32::MAX;

/// Node→partition map plus per-partition member lists.
///
/// Invariants: members are disjoint, their union is the full node set,
/// and each list is sorted ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionAssignment {
    num_workers: usize,
    node_to_partition: Vec<u32>,
    members: Vec<Vec<u64>>,
}

impl PartitionAssignment {
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn partition_of(&self, node: u64) -> Option<u32> {
        self.node_to_partition.get(node as usize).copied()
    }

    pub fn members(&self, worker: usize) -> Result<&[u64]> {
        self.members
            .get(worker)
            .map(|m| m.as_slice())
            .ok_or(GraphError::PartitionNotFound(worker))
    }
}

/// Owns the assignment and answers partition/halo queries against the
/// immutable store. Built once at startup, read-only afterwards.
#[derive(Debug)]
pub struct PartitionManager {
    store: Arc<GraphStore>,
    assignment: PartitionAssignment,
}

impl PartitionManager {
    /// Greedy streaming partition of the whole graph.
    ///
    /// Each partition is capped at `ceil(N / num_workers) +
    /// balance_tolerance` nodes. Fails with `Configuration` for zero
    /// workers or an empty graph.
    pub fn partition(
        store: Arc<GraphStore>,
        num_workers: usize,
        balance_tolerance: usize,
    ) -> Result<Self> {
        if num_workers == 0 {
            return Err(GraphError::Configuration(
                "num_workers must be positive".into(),
            ));
        }
        let n = store.num_nodes();
        if n == 0 {
            return Err(GraphError::Configuration("graph is empty".into()));
        }

        let cap = (n + num_workers - 1) / num_workers + balance_tolerance;

        // High-degree nodes first; ties by id keep the pass deterministic.
        let mut order: Vec<u64> = (0..n as u64).collect();
        order.par_sort_unstable_by(|&a, &b| {
            store
                .degree(b)
                .cmp(&store.degree(a))
                .then_with(|| a.cmp(&b))
        });

        let mut node_to_partition = vec![UNASSIGNED; n];
        let mut sizes = vec![0usize; num_workers];
        let mut neighbor_counts = vec![0usize; num_workers];

        for &node in &order {
            for c in neighbor_counts.iter_mut() {
                *c = 0;
            }
            for &nb in store.neighbors(node) {
                let p = node_to_partition[nb as usize];
                if p != UNASSIGNED {
                    neighbor_counts[p as usize] += 1;
                }
            }

            // Best neighbor-majority partition among those with room,
            // ties by smaller current size then lower index.
            let mut best: Option<usize> = None;
            for p in 0..num_workers {
                if sizes[p] >= cap || neighbor_counts[p] == 0 {
                    continue;
                }
                best = match best {
                    None => Some(p),
                    Some(b) => {
                        if neighbor_counts[p] > neighbor_counts[b]
                            || (neighbor_counts[p] == neighbor_counts[b] && sizes[p] < sizes[b])
                        {
                            Some(p)
                        } else {
                            Some(b)
                        }
                    }
                };
            }

            // No assigned neighbors anywhere with room: least-loaded.
            let target = best.unwrap_or_else(|| {
                (0..num_workers)
                    .filter(|&p| sizes[p] < cap)
                    .min_by_key(|&p| (sizes[p], p))
                    .expect("cap * num_workers >= n, so some partition has room")
            });

            node_to_partition[node as usize] = target as u32;
            sizes[target] += 1;
        }

        let mut members: Vec<Vec<u64>> = vec![Vec::new(); num_workers];
        for (node, &p) in node_to_partition.iter().enumerate() {
            members[p as usize].push(node as u64);
        }

        let manager = Self {
            store,
            assignment: PartitionAssignment {
                num_workers,
                node_to_partition,
                members,
            },
        };

        info!(
            workers = num_workers,
            cap,
            edge_cut = manager.edge_cut(),
            "graph partitioned"
        );
        Ok(manager)
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn num_workers(&self) -> usize {
        self.assignment.num_workers
    }

    pub fn members(&self, worker: usize) -> Result<&[u64]> {
        self.assignment.members(worker)
    }

    /// Out-of-partition nodes reachable within `hop_count` hops of any
    /// node owned by `worker`. Sorted ascending.
    pub fn compute_halo(&self, worker: usize, hop_count: usize) -> Result<Vec<u64>> {
        let owned = self.assignment.members(worker)?;

        let mut visited = vec![false; self.store.num_nodes()];
        let mut queue: VecDeque<(u64, usize)> = VecDeque::new();
        for &node in owned {
            visited[node as usize] = true;
            queue.push_back((node, 0));
        }

        let mut halo = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if depth == hop_count {
                continue;
            }
            for &nb in self.store.neighbors(node) {
                if visited[nb as usize] {
                    continue;
                }
                visited[nb as usize] = true;
                if self.assignment.partition_of(nb) != Some(worker as u32) {
                    halo.push(nb);
                }
                queue.push_back((nb, depth + 1));
            }
        }

        halo.sort_unstable();
        Ok(halo)
    }

    /// Number of adjacency entries whose endpoints fall in different
    /// partitions. For undirected graphs each cut edge appears twice
    /// (both directions are stored).
    pub fn edge_cut(&self) -> usize {
        (0..self.store.num_nodes() as u64)
            .map(|node| {
                let p = self.assignment.partition_of(node);
                self.store
                    .neighbors(node)
                    .iter()
                    .filter(|&&nb| self.assignment.partition_of(nb) != p)
                    .count()
            })
            .sum()
    }

    /// Persist the assignment so a restart can skip recomputation.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(&self.assignment)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a persisted assignment, validating it against the store.
    pub fn load(path: &Path, store: Arc<GraphStore>, num_workers: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let assignment: PartitionAssignment = bincode::deserialize(&bytes)?;

        if assignment.num_workers != num_workers {
            return Err(GraphError::DatasetFormat(format!(
                "persisted assignment has {} workers, server configured for {}",
                assignment.num_workers, num_workers
            )));
        }
        if assignment.node_to_partition.len() != store.num_nodes() {
            return Err(GraphError::DatasetFormat(format!(
                "persisted assignment covers {} nodes, store has {}",
                assignment.node_to_partition.len(),
                store.num_nodes()
            )));
        }
        if assignment
            .node_to_partition
            .iter()
            .any(|&p| p as usize >= num_workers)
        {
            return Err(GraphError::DatasetFormat(
                "persisted assignment references an unknown partition".into(),
            ));
        }

        Ok(Self { store, assignment })
    }
}
