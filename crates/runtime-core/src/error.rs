//! Error types for the training orchestrator

use thiserror::Error;

/// Result type alias using the orchestrator Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown configuration key: {key}")]
    UnknownConfigKey { key: String },

    #[error("Invalid run name: {name} ({reason})")]
    InvalidRunName { name: String, reason: String },

    // Mesh errors
    #[error("Mesh axes multiply to {axis_product} devices but {device_count} are available")]
    MeshSizeMismatch {
        axis_product: usize,
        device_count: usize,
    },

    #[error("Duplicate mesh axis: {axis}")]
    DuplicateMeshAxis { axis: String },

    // Sharding rule errors
    #[error("Rule references unknown mesh axis: {axis}")]
    UnknownMeshAxis { axis: String },

    #[error("No rule matches logical dimension: {logical}")]
    UnmatchedLogicalDim { logical: String },

    #[error("Mesh axis {axis} assigned to more than one dimension of {array}")]
    AxisReuse { axis: String, array: String },

    #[error(
        "Dimension {dim} of {array} has size {dim_size}, not divisible by mesh axis {axis} of size {axis_size}"
    )]
    UnevenPartition {
        array: String,
        dim: usize,
        dim_size: usize,
        axis: String,
        axis_size: usize,
    },

    // Train state errors
    #[error("Parameter not found: {name}")]
    ParameterNotFound { name: String },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Replica divergence in {name}: {message}")]
    ReplicaDivergence { name: String, message: String },

    // Checkpoint errors
    #[error("Checkpoint not found for step {step}")]
    CheckpointNotFound { step: u64 },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("No valid checkpoint found for recovery")]
    NoCheckpointForRecovery,

    #[error("Run already locked by another writer: {path}")]
    RunLocked { path: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage backend not available: {backend}")]
    StorageUnavailable { backend: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Collective errors
    #[error("Collective operation failed at step {step}: {message}")]
    Collective { step: u64, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. }
                | Error::StorageUnavailable { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::UnknownConfigKey { .. }
                | Error::InvalidRunName { .. }
                | Error::MeshSizeMismatch { .. }
                | Error::DuplicateMeshAxis { .. }
                | Error::UnknownMeshAxis { .. }
                | Error::UnmatchedLogicalDim { .. }
                | Error::AxisReuse { .. }
                | Error::UnevenPartition { .. }
                | Error::ShapeMismatch { .. }
                | Error::ReplicaDivergence { .. }
                | Error::Collective { .. }
                | Error::RunLocked { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Storage { .. } => Some(100),
            Error::StorageUnavailable { .. } => Some(5000),
            Error::Timeout { .. } => Some(1000),
            Error::Io(_) => Some(100),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
