//! On-disk dataset format.
//!
//! A dataset directory holds `meta.json` plus binary columns:
//!
//! - `adjacency.bin` — magic, node/edge counts, CSR offsets, CSR targets
//!   (all little-endian u64)
//! - `features.bin`  — row-major f32, `num_nodes * feature_dim` values
//! - `labels.bin`    — optional, one u64 per node
//!
//! `meta.json` carries the counts and a BLAKE3 checksum per file; `load`
//! verifies every checksum before trusting the bytes. The feature slab
//! is memory-mapped, adjacency is parsed into owned CSR arrays.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GraphError, Result};
use crate::store::GraphStore;

const MAGIC: u32 = 0x48_47_52_31; // "HGR1"
const FORMAT_VERSION: u32 = 1;

const META_FILE: &str = "meta.json";
const ADJACENCY_FILE: &str = "adjacency.bin";
const FEATURES_FILE: &str = "features.bin";
const LABELS_FILE: &str = "labels.bin";

#[derive(Debug, Serialize, Deserialize)]
struct DatasetMeta {
    version: u32,
    num_nodes: u64,
    num_edges: u64,
    feature_dim: u64,
    has_labels: bool,
    adjacency_checksum: String,
    features_checksum: String,
    #[serde(default)]
    labels_checksum: Option<String>,
}

/// Write a store out as a loadable dataset directory.
pub fn write_dataset(dir: &Path, store: &GraphStore) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut adjacency = Vec::with_capacity(24 + (store.raw_offsets().len() + store.raw_targets().len()) * 8);
    adjacency.extend_from_slice(&MAGIC.to_le_bytes());
    adjacency.extend_from_slice(&(store.num_nodes() as u64).to_le_bytes());
    adjacency.extend_from_slice(&(store.num_edges() as u64).to_le_bytes());
    for v in store.raw_offsets() {
        adjacency.extend_from_slice(&v.to_le_bytes());
    }
    for v in store.raw_targets() {
        adjacency.extend_from_slice(&v.to_le_bytes());
    }
    File::create(dir.join(ADJACENCY_FILE))?.write_all(&adjacency)?;

    let features = store.raw_feature_bytes();
    File::create(dir.join(FEATURES_FILE))?.write_all(features)?;

    let labels_checksum = match store.raw_labels() {
        Some(labels) => {
            let mut bytes = Vec::with_capacity(labels.len() * 8);
            for v in labels {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            File::create(dir.join(LABELS_FILE))?.write_all(&bytes)?;
            Some(blake3::hash(&bytes).to_hex().to_string())
        }
        None => None,
    };

    let meta = DatasetMeta {
        version: FORMAT_VERSION,
        num_nodes: store.num_nodes() as u64,
        num_edges: store.num_edges() as u64,
        feature_dim: store.feature_dim() as u64,
        has_labels: labels_checksum.is_some(),
        adjacency_checksum: blake3::hash(&adjacency).to_hex().to_string(),
        features_checksum: blake3::hash(features).to_hex().to_string(),
        labels_checksum,
    };
    let json = serde_json::to_vec_pretty(&meta)?;
    File::create(dir.join(META_FILE))?.write_all(&json)?;

    Ok(())
}

/// Load a dataset directory into a `GraphStore`.
///
/// Adjacency is parsed into owned CSR arrays; the feature slab stays
/// memory-mapped. Any structural or checksum mismatch fails with
/// `DatasetFormat`.
pub fn load(dir: &Path) -> Result<GraphStore> {
    let meta_path = dir.join(META_FILE);
    let mut meta_bytes = Vec::new();
    File::open(&meta_path)
        .map_err(|e| GraphError::DatasetFormat(format!("cannot open {}: {}", meta_path.display(), e)))?
        .read_to_end(&mut meta_bytes)?;
    let meta: DatasetMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| GraphError::DatasetFormat(format!("invalid meta.json: {}", e)))?;

    if meta.version != FORMAT_VERSION {
        return Err(GraphError::DatasetFormat(format!(
            "unsupported dataset version {} (expected {})",
            meta.version, FORMAT_VERSION
        )));
    }

    // Adjacency: read fully, verify, parse
    let mut adjacency = Vec::new();
    File::open(dir.join(ADJACENCY_FILE))
        .map_err(|e| GraphError::DatasetFormat(format!("cannot open adjacency.bin: {}", e)))?
        .read_to_end(&mut adjacency)?;
    verify_checksum("adjacency.bin", &adjacency, &meta.adjacency_checksum)?;

    let num_nodes = meta.num_nodes as usize;
    let num_edges = meta.num_edges as usize;
    let expected_len = 20 + (num_nodes + 1 + num_edges) * 8;
    if adjacency.len() != expected_len {
        return Err(GraphError::DatasetFormat(format!(
            "adjacency.bin is {} bytes, expected {}",
            adjacency.len(),
            expected_len
        )));
    }
    if read_u32_at(&adjacency, 0) != MAGIC {
        return Err(GraphError::DatasetFormat("adjacency.bin has wrong magic".into()));
    }
    if read_u64_at(&adjacency, 4) != meta.num_nodes || read_u64_at(&adjacency, 12) != meta.num_edges {
        return Err(GraphError::DatasetFormat(
            "adjacency.bin header disagrees with meta.json".into(),
        ));
    }

    let mut offsets = Vec::with_capacity(num_nodes + 1);
    let mut pos = 20;
    for _ in 0..=num_nodes {
        offsets.push(read_u64_at(&adjacency, pos));
        pos += 8;
    }
    let mut targets = Vec::with_capacity(num_edges);
    for _ in 0..num_edges {
        targets.push(read_u64_at(&adjacency, pos));
        pos += 8;
    }

    for w in offsets.windows(2) {
        if w[1] < w[0] {
            return Err(GraphError::DatasetFormat("CSR offsets not monotonic".into()));
        }
    }
    if offsets.first() != Some(&0) || offsets.last() != Some(&(num_edges as u64)) {
        return Err(GraphError::DatasetFormat("CSR offsets do not span the edge list".into()));
    }
    if let Some(&bad) = targets.iter().find(|&&t| t >= meta.num_nodes) {
        return Err(GraphError::DatasetFormat(format!(
            "edge target {} outside node range 0..{}",
            bad, meta.num_nodes
        )));
    }

    // Features: mmap, verify over the mapping
    let feature_file = File::open(dir.join(FEATURES_FILE))
        .map_err(|e| GraphError::DatasetFormat(format!("cannot open features.bin: {}", e)))?;
    let features = unsafe { Mmap::map(&feature_file) }.map_err(GraphError::Io)?;
    verify_checksum("features.bin", &features, &meta.features_checksum)?;
    let expected_feat = num_nodes * meta.feature_dim as usize * 4;
    if features.len() != expected_feat {
        return Err(GraphError::DatasetFormat(format!(
            "features.bin is {} bytes, expected {}",
            features.len(),
            expected_feat
        )));
    }

    let labels = if meta.has_labels {
        let mut bytes = Vec::new();
        File::open(dir.join(LABELS_FILE))
            .map_err(|e| GraphError::DatasetFormat(format!("cannot open labels.bin: {}", e)))?
            .read_to_end(&mut bytes)?;
        if let Some(expected) = &meta.labels_checksum {
            verify_checksum("labels.bin", &bytes, expected)?;
        }
        if bytes.len() != num_nodes * 8 {
            return Err(GraphError::DatasetFormat(format!(
                "labels.bin is {} bytes, expected {}",
                bytes.len(),
                num_nodes * 8
            )));
        }
        Some(bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect())
    } else {
        None
    };

    info!(
        nodes = num_nodes,
        edges = num_edges,
        feature_dim = meta.feature_dim,
        "dataset loaded"
    );

    Ok(GraphStore::from_parts(
        num_nodes,
        meta.feature_dim as usize,
        offsets,
        targets,
        features,
        feature_file,
        labels,
    ))
}

fn verify_checksum(name: &str, bytes: &[u8], expected: &str) -> Result<()> {
    let actual = blake3::hash(bytes).to_hex().to_string();
    if actual != expected {
        return Err(GraphError::DatasetFormat(format!(
            "{} checksum mismatch (expected {}, got {})",
            name, expected, actual
        )));
    }
    Ok(())
}

#[inline]
fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

#[inline]
fn read_u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}
