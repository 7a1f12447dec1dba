//! Halograph - partitioned feature serving for graph neural network training.
//!
//! A static graph is loaded once, split across training workers, and served
//! over a length-prefixed MessagePack protocol. Each worker gets a budgeted
//! in-memory feature cache pre-warmed with its partition's hottest nodes, so
//! minibatch sampling resolves most feature lookups without touching the
//! backing store.
//!
//! Modules:
//! - [`store`]: immutable CSR adjacency plus memory-mapped feature slab
//! - [`partition`]: streaming greedy partitioner and halo expansion
//! - [`cache`]: sharded frequency/recency feature cache
//! - [`sample`]: seeded layer-wise neighborhood sampling
//! - [`session`]: per-connection client state
//! - [`metrics`]: request counters and latency percentiles
//! - [`resource`]: host probing for cache and pool sizing

pub mod cache;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod resource;
pub mod sample;
pub mod session;
pub mod store;

pub use cache::{CacheStats, FeatureCache};
pub use error::{GraphError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use partition::{PartitionAssignment, PartitionManager};
pub use sample::{Provenance, SampleRequest, SampleResult, SamplingEngine};
pub use session::ClientSession;
pub use store::GraphStore;
