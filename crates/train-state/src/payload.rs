//! Mesh-independent checkpoint payloads

use bytes::Bytes;
use runtime_core::{Error, Result, Step};
use serde::{Deserialize, Serialize};

/// One parameter's full global array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterPayload {
    pub name: String,
    pub global_shape: Vec<usize>,
    pub logical_dims: Vec<String>,
    pub values: Vec<f32>,
}

/// Serialized train state
///
/// Arrays are stored in global form, so the payload carries no trace of
/// the mesh that produced it and any rehydrating process may re-shard
/// onto its own topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Completed-step count at capture time
    pub step: Step,

    /// Parameters in model order
    pub params: Vec<ParameterPayload>,
}

impl CheckpointPayload {
    /// Serialize with bincode
    pub fn to_bytes(&self) -> Result<Bytes> {
        let encoded = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    /// Deserialize from bincode
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Total number of array elements across parameters
    pub fn element_count(&self) -> usize {
        self.params.iter().map(|p| p.values.len()).sum()
    }
}
