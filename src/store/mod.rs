//! Immutable graph storage: CSR adjacency + node feature slab.
//!
//! A `GraphStore` is built exactly once — either in memory from an edge
//! list (`from_edges`, used by tests and ephemeral setups) or from an
//! on-disk dataset directory (`load`, which memory-maps the feature
//! slab). After construction every access path is `&self`; nothing in
//! the serving pipeline can mutate it.

pub mod dataset;

use std::fs::File;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{GraphError, Result};

/// Backing bytes for the feature slab: owned for ephemeral graphs,
/// memory-mapped for loaded datasets.
#[derive(Debug)]
enum Slab {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Slab {
    fn bytes(&self) -> &[u8] {
        match self {
            Slab::Owned(v) => v,
            Slab::Mapped(m) => m,
        }
    }
}

/// Immutable graph: CSR adjacency, fixed-width f32 node features,
/// optional per-node labels.
#[derive(Debug)]
pub struct GraphStore {
    num_nodes: usize,
    feature_dim: usize,
    /// CSR row offsets, `num_nodes + 1` entries.
    offsets: Vec<u64>,
    /// CSR neighbor targets, `offsets[num_nodes]` entries.
    targets: Vec<u64>,
    features: Slab,
    labels: Option<Vec<u64>>,
    /// Kept open for posix_fadvise on the mapped feature file.
    feature_file: Option<File>,
}

impl GraphStore {
    /// Build an in-memory store from an edge list.
    ///
    /// `undirected` stores both directions of every edge. Feature vector
    /// length must be `num_nodes * feature_dim`.
    pub fn from_edges(
        num_nodes: usize,
        edges: &[(u64, u64)],
        undirected: bool,
        features: Vec<f32>,
        feature_dim: usize,
        labels: Option<Vec<u64>>,
    ) -> Result<Self> {
        for &(src, dst) in edges {
            if src as usize >= num_nodes || dst as usize >= num_nodes {
                return Err(GraphError::DatasetFormat(format!(
                    "edge ({}, {}) references a node outside 0..{}",
                    src, dst, num_nodes
                )));
            }
        }
        if features.len() != num_nodes * feature_dim {
            return Err(GraphError::DatasetFormat(format!(
                "feature slab has {} values, expected {} ({} nodes x dim {})",
                features.len(),
                num_nodes * feature_dim,
                num_nodes,
                feature_dim
            )));
        }
        if let Some(ref l) = labels {
            if l.len() != num_nodes {
                return Err(GraphError::DatasetFormat(format!(
                    "label column has {} entries, expected {}",
                    l.len(),
                    num_nodes
                )));
            }
        }

        let (offsets, targets) = build_csr(num_nodes, edges, undirected);

        let mut bytes = Vec::with_capacity(features.len() * 4);
        for v in &features {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        Ok(Self {
            num_nodes,
            feature_dim,
            offsets,
            targets,
            features: Slab::Owned(bytes),
            labels,
            feature_file: None,
        })
    }

    pub(crate) fn from_parts(
        num_nodes: usize,
        feature_dim: usize,
        offsets: Vec<u64>,
        targets: Vec<u64>,
        features: Mmap,
        feature_file: File,
        labels: Option<Vec<u64>>,
    ) -> Self {
        Self {
            num_nodes,
            feature_dim,
            offsets,
            targets,
            features: Slab::Mapped(features),
            labels,
            feature_file: Some(feature_file),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.targets.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn contains(&self, node: u64) -> bool {
        (node as usize) < self.num_nodes
    }

    pub fn degree(&self, node: u64) -> usize {
        let n = node as usize;
        if n >= self.num_nodes {
            return 0;
        }
        (self.offsets[n + 1] - self.offsets[n]) as usize
    }

    /// Neighbor slice for a node. Empty for out-of-range ids; callers
    /// that need an error use `check_node` first.
    pub fn neighbors(&self, node: u64) -> &[u64] {
        let n = node as usize;
        if n >= self.num_nodes {
            return &[];
        }
        &self.targets[self.offsets[n] as usize..self.offsets[n + 1] as usize]
    }

    pub fn check_node(&self, node: u64) -> Result<()> {
        if self.contains(node) {
            Ok(())
        } else {
            Err(GraphError::InvalidNode(node))
        }
    }

    /// Feature row for a node, copied out of the slab into an owned
    /// payload suitable for caching.
    pub fn feature(&self, node: u64) -> Result<Arc<[f32]>> {
        self.check_node(node)?;
        let row_bytes = self.feature_dim * 4;
        let start = node as usize * row_bytes;
        let bytes = &self.features.bytes()[start..start + row_bytes];
        let row: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(row.into())
    }

    /// Byte size of one feature payload (for cache accounting).
    pub fn feature_row_bytes(&self) -> usize {
        self.feature_dim * 4
    }

    pub fn label(&self, node: u64) -> Option<u64> {
        self.labels
            .as_ref()
            .and_then(|l| l.get(node as usize).copied())
    }

    pub(crate) fn raw_feature_bytes(&self) -> &[u8] {
        self.features.bytes()
    }

    pub(crate) fn raw_offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub(crate) fn raw_targets(&self) -> &[u64] {
        &self.targets
    }

    pub(crate) fn raw_labels(&self) -> Option<&[u64]> {
        self.labels.as_deref()
    }

    /// Hint the kernel to read the mapped feature file ahead of the
    /// pre-warm scan. No-op for in-memory slabs.
    #[cfg(unix)]
    pub fn advise_willneed(&self) {
        use std::os::unix::io::AsRawFd;
        if let Some(file) = &self.feature_file {
            unsafe {
                libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn advise_willneed(&self) {}
}

/// Build CSR arrays from an edge list with counting sort.
fn build_csr(num_nodes: usize, edges: &[(u64, u64)], undirected: bool) -> (Vec<u64>, Vec<u64>) {
    let mut degree = vec![0u64; num_nodes];
    for &(src, dst) in edges {
        degree[src as usize] += 1;
        if undirected {
            degree[dst as usize] += 1;
        }
    }

    let mut offsets = vec![0u64; num_nodes + 1];
    for i in 0..num_nodes {
        offsets[i + 1] = offsets[i] + degree[i];
    }

    let mut targets = vec![0u64; offsets[num_nodes] as usize];
    let mut cursor = offsets[..num_nodes].to_vec();
    for &(src, dst) in edges {
        targets[cursor[src as usize] as usize] = dst;
        cursor[src as usize] += 1;
        if undirected {
            targets[cursor[dst as usize] as usize] = src;
            cursor[dst as usize] += 1;
        }
    }

    // Sorted neighbor lists make sampling order deterministic
    for i in 0..num_nodes {
        targets[offsets[i] as usize..offsets[i + 1] as usize].sort_unstable();
    }

    (offsets, targets)
}
