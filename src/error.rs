//! Error types for the partition/cache/serving engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Node {0} is not in the graph")]
    InvalidNode(u64),

    #[error("No partition for worker index {0}")]
    PartitionNotFound(usize),

    #[error("Malformed dataset: {0}")]
    DatasetFormat(String),

    #[error("Server at capacity, retry with backoff")]
    ServerBusy,

    #[error("Request exceeded its time bound")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::Configuration(_) => "CONFIGURATION_ERROR",
            GraphError::InvalidNode(_) => "INVALID_NODE",
            GraphError::PartitionNotFound(_) => "PARTITION_NOT_FOUND",
            GraphError::DatasetFormat(_) => "DATASET_FORMAT",
            GraphError::ServerBusy => "SERVER_BUSY",
            GraphError::Timeout => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}
