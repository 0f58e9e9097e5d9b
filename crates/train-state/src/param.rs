//! Sharded parameters

use mesh::{MeshSpec, PartitionLayout, RuleTable};
use runtime_core::{DeviceId, Error, Result};
use serde::{Deserialize, Serialize};

/// Shape declaration for one model parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Unique parameter name
    pub name: String,

    /// Global array shape
    pub global_shape: Vec<usize>,

    /// Logical dimension name per shape entry, resolved through the rule
    /// table
    pub logical_dims: Vec<String>,
}

impl ParameterSpec {
    pub fn new(
        name: impl Into<String>,
        global_shape: Vec<usize>,
        logical_dims: Vec<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            global_shape,
            logical_dims: logical_dims.into_iter().map(str::to_string).collect(),
        }
    }

    /// Elements in the global array
    pub fn global_len(&self) -> usize {
        self.global_shape.iter().product()
    }
}

/// One parameter split into per-device shards
///
/// Every device holds a dense `Vec<f32>` with its slice of the global
/// array; devices sharing a partition hold bit-identical replicas.
#[derive(Debug, Clone)]
pub struct ShardedParameter {
    spec: ParameterSpec,
    layout: PartitionLayout,
    pub(crate) shards: Vec<Vec<f32>>,
}

impl ShardedParameter {
    /// Shard a global array over the mesh
    pub fn from_global(
        spec: ParameterSpec,
        mesh: &MeshSpec,
        rules: &RuleTable,
        global: &[f32],
    ) -> Result<Self> {
        let layout = PartitionLayout::compute(
            &spec.name,
            &spec.global_shape,
            &spec.logical_dims,
            mesh,
            rules,
        )?;

        let mut shards = Vec::with_capacity(mesh.device_count());
        for device in 0..mesh.device_count() {
            shards.push(layout.extract_shard(global, device)?);
        }

        Ok(Self {
            spec,
            layout,
            shards,
        })
    }

    pub fn spec(&self) -> &ParameterSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// One device's shard
    pub fn shard(&self, device: DeviceId) -> &[f32] {
        &self.shards[device]
    }

    /// Reassemble the full global array from one replica of each partition
    pub fn to_global(&self) -> Result<Vec<f32>> {
        let mut global = vec![0.0f32; self.spec.global_len()];
        for device in 0..self.shards.len() {
            self.layout
                .scatter_shard(&self.shards[device], &mut global, device)?;
        }
        Ok(global)
    }

    /// Add a dense global delta to every shard
    ///
    /// Each device applies exactly the slice of the delta its shard covers,
    /// so replicas of a partition receive identical arithmetic.
    pub fn apply_dense_delta(&mut self, delta: &[f32]) -> Result<()> {
        if delta.len() != self.spec.global_len() {
            return Err(Error::ShapeMismatch {
                name: self.spec.name.clone(),
                expected: self.spec.global_shape.clone(),
                actual: vec![delta.len()],
            });
        }

        for device in 0..self.shards.len() {
            let delta_shard = self.layout.extract_shard(delta, device)?;
            for (value, d) in self.shards[device].iter_mut().zip(delta_shard) {
                *value += d;
            }
        }
        Ok(())
    }

    /// Check that devices sharing a partition hold bit-identical shards
    pub fn verify_replica_consistency(&self) -> Result<()> {
        for group in self.layout.replica_groups() {
            let leader = group[0];
            for &device in &group[1..] {
                let leader_shard = &self.shards[leader];
                let shard = &self.shards[device];
                for (index, (a, b)) in leader_shard.iter().zip(shard).enumerate() {
                    if a.to_bits() != b.to_bits() {
                        return Err(Error::ReplicaDivergence {
                            name: self.spec.name.clone(),
                            message: format!(
                                "devices {leader} and {device} differ at element {index}"
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh::{AxisRule, MeshAxis};

    fn mesh_4x2() -> MeshSpec {
        MeshSpec::build(
            vec![
                MeshAxis::new("data", 4).unwrap(),
                MeshAxis::new("model", 2).unwrap(),
            ],
            8,
        )
        .unwrap()
    }

    fn rules() -> RuleTable {
        RuleTable::new(vec![
            AxisRule::new("batch", vec!["data".to_string()]),
            AxisRule::new("embed", vec!["model".to_string()]),
        ])
    }

    fn spec_8x4() -> ParameterSpec {
        ParameterSpec::new("kernel", vec![8, 4], vec!["batch", "embed"])
    }

    #[test]
    fn test_global_round_trip() {
        let mesh = mesh_4x2();
        let global: Vec<f32> = (0..32).map(|v| v as f32).collect();
        let param = ShardedParameter::from_global(spec_8x4(), &mesh, &rules(), &global).unwrap();
        assert_eq!(param.to_global().unwrap(), global);
    }

    #[test]
    fn test_dense_delta_applies_per_shard() {
        let mesh = mesh_4x2();
        let global = vec![1.0f32; 32];
        let mut param =
            ShardedParameter::from_global(spec_8x4(), &mesh, &rules(), &global).unwrap();

        let delta: Vec<f32> = (0..32).map(|v| v as f32).collect();
        param.apply_dense_delta(&delta).unwrap();

        let expected: Vec<f32> = (0..32).map(|v| 1.0 + v as f32).collect();
        assert_eq!(param.to_global().unwrap(), expected);
        param.verify_replica_consistency().unwrap();
    }

    #[test]
    fn test_replicated_parameter_stays_consistent() {
        let mesh = mesh_4x2();
        let spec = ParameterSpec::new("norm_scale", vec![16], vec!["unlisted"]);
        let global: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut param = ShardedParameter::from_global(spec, &mesh, &rules(), &global).unwrap();

        assert_eq!(param.layout().replication_factor(), 8);
        param.apply_dense_delta(&vec![0.5f32; 16]).unwrap();
        param.verify_replica_consistency().unwrap();
    }

    #[test]
    fn test_replica_divergence_detected() {
        let mesh = mesh_4x2();
        let spec = ParameterSpec::new("norm_scale", vec![16], vec!["unlisted"]);
        let global = vec![0.0f32; 16];
        let mut param = ShardedParameter::from_global(spec, &mesh, &rules(), &global).unwrap();

        param.shards[3][7] = 1.0;
        let err = param.verify_replica_consistency().unwrap_err();
        assert!(matches!(err, Error::ReplicaDivergence { name, .. } if name == "norm_scale"));
    }

    #[test]
    fn test_delta_length_checked() {
        let mesh = mesh_4x2();
        let global = vec![0.0f32; 32];
        let mut param =
            ShardedParameter::from_global(spec_8x4(), &mesh, &rules(), &global).unwrap();
        assert!(matches!(
            param.apply_dense_delta(&[0.0; 31]),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
