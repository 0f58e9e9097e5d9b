//! The sharded train state store

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use mesh::{MeshSpec, RuleTable};
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::{Error, Result, Step};
use tracing::{debug, info};

use crate::param::{ParameterSpec, ShardedParameter};
use crate::payload::{CheckpointPayload, ParameterPayload};

/// Half-width of the uniform initialization interval
const INIT_SCALE: f32 = 0.02;

/// Complete sharded training state for one process
///
/// The step counter here is the single source of truth for run progress
/// and only moves forward. Parameters keep their model order so payloads
/// are comparable across runs.
#[derive(Debug, Clone)]
pub struct TrainState {
    step: Step,
    params: Vec<ShardedParameter>,
    index_by_name: HashMap<String, usize>,
    mesh: MeshSpec,
    rules: RuleTable,
}

impl TrainState {
    /// Allocate and deterministically initialize all parameters
    ///
    /// Each parameter's values are drawn from a ChaCha stream seeded by
    /// the run seed and the parameter name, generated in global form and
    /// then sliced per device. Two fresh starts with the same
    /// configuration are bit-identical regardless of mesh shape.
    pub fn initialize(
        specs: &[ParameterSpec],
        mesh: &MeshSpec,
        rules: &RuleTable,
        seed: u64,
    ) -> Result<Self> {
        rules.validate(mesh)?;

        let mut params = Vec::with_capacity(specs.len());
        let mut index_by_name = HashMap::with_capacity(specs.len());
        for spec in specs {
            if index_by_name
                .insert(spec.name.clone(), params.len())
                .is_some()
            {
                return Err(Error::InvalidConfig {
                    message: format!("duplicate parameter name: {}", spec.name),
                });
            }

            let global = generate_initial_values(seed, &spec.name, spec.global_len());
            params.push(ShardedParameter::from_global(
                spec.clone(),
                mesh,
                rules,
                &global,
            )?);
            debug!(
                name = %spec.name,
                shape = ?spec.global_shape,
                "Initialized parameter"
            );
        }

        info!(
            parameters = params.len(),
            devices = mesh.device_count(),
            seed,
            "Initialized train state"
        );

        Ok(Self {
            step: 0,
            params,
            index_by_name,
            mesh: mesh.clone(),
            rules: rules.clone(),
        })
    }

    /// Completed-step count
    pub fn step(&self) -> Step {
        self.step
    }

    /// Record one more completed step and return the new count
    pub fn advance_step(&mut self) -> Step {
        self.step += 1;
        self.step
    }

    pub fn mesh(&self) -> &MeshSpec {
        &self.mesh
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn parameters(&self) -> &[ShardedParameter] {
        &self.params
    }

    pub fn parameter(&self, name: &str) -> Option<&ShardedParameter> {
        self.index_by_name
            .get(name)
            .map(|&index| &self.params[index])
    }

    /// Apply dense global deltas, one per named parameter
    ///
    /// Every replica of a partition applies the identical slice, so
    /// replicas cannot drift.
    pub fn apply_update(&mut self, updates: &[(String, Vec<f32>)]) -> Result<()> {
        for (name, delta) in updates {
            let index =
                *self
                    .index_by_name
                    .get(name)
                    .ok_or_else(|| Error::ParameterNotFound {
                        name: name.clone(),
                    })?;
            self.params[index].apply_dense_delta(delta)?;
        }
        Ok(())
    }

    /// Check every parameter's replicas for bit-identical values
    pub fn verify_replica_consistency(&self) -> Result<()> {
        for param in &self.params {
            param.verify_replica_consistency()?;
        }
        Ok(())
    }

    /// Assemble the mesh-independent payload for checkpointing
    pub fn materialize(&self) -> Result<CheckpointPayload> {
        let mut params = Vec::with_capacity(self.params.len());
        for param in &self.params {
            params.push(ParameterPayload {
                name: param.spec().name.clone(),
                global_shape: param.spec().global_shape.clone(),
                logical_dims: param.spec().logical_dims.clone(),
                values: param.to_global()?,
            });
        }
        Ok(CheckpointPayload {
            step: self.step,
            params,
        })
    }

    /// Rebuild sharded state from a payload on the given mesh
    ///
    /// The payload must cover exactly the expected parameter set with
    /// unchanged global shapes; the mesh and rules may differ from the
    /// ones that produced it, in which case the arrays re-shard.
    pub fn rehydrate(
        payload: &CheckpointPayload,
        specs: &[ParameterSpec],
        mesh: &MeshSpec,
        rules: &RuleTable,
    ) -> Result<Self> {
        rules.validate(mesh)?;

        let mut payload_by_name: HashMap<&str, &ParameterPayload> = payload
            .params
            .iter()
            .map(|param| (param.name.as_str(), param))
            .collect();

        let mut params = Vec::with_capacity(specs.len());
        let mut index_by_name = HashMap::with_capacity(specs.len());
        for spec in specs {
            let stored =
                payload_by_name
                    .remove(spec.name.as_str())
                    .ok_or_else(|| Error::ParameterNotFound {
                        name: spec.name.clone(),
                    })?;
            if stored.global_shape != spec.global_shape {
                return Err(Error::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.global_shape.clone(),
                    actual: stored.global_shape.clone(),
                });
            }

            index_by_name.insert(spec.name.clone(), params.len());
            params.push(ShardedParameter::from_global(
                spec.clone(),
                mesh,
                rules,
                &stored.values,
            )?);
        }

        if let Some(name) = payload_by_name.keys().next() {
            return Err(Error::InvalidConfig {
                message: format!("checkpoint contains unknown parameter: {name}"),
            });
        }

        info!(
            step = payload.step,
            parameters = params.len(),
            devices = mesh.device_count(),
            "Rehydrated train state"
        );

        Ok(Self {
            step: payload.step,
            params,
            index_by_name,
            mesh: mesh.clone(),
            rules: rules.clone(),
        })
    }
}

/// Deterministic per-parameter initial values
fn generate_initial_values(seed: u64, name: &str, len: usize) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(parameter_seed(seed, name));
    let dist = Uniform::new_inclusive(-INIT_SCALE, INIT_SCALE);
    (0..len).map(|_| dist.sample(&mut rng)).collect()
}

/// Derive a parameter's seed from the run seed and its name
fn parameter_seed(seed: u64, name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh::{AxisRule, MeshAxis};

    fn mesh(data: usize, model: usize) -> MeshSpec {
        MeshSpec::build(
            vec![
                MeshAxis::new("data", data).unwrap(),
                MeshAxis::new("model", model).unwrap(),
            ],
            data * model,
        )
        .unwrap()
    }

    fn rules() -> RuleTable {
        RuleTable::new(vec![
            AxisRule::new("batch", vec!["data".to_string()]),
            AxisRule::new("embed", vec!["model".to_string()]),
        ])
    }

    fn specs() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("kernel", vec![8, 4], vec!["batch", "embed"]),
            ParameterSpec::new("bias", vec![4], vec!["embed"]),
        ]
    }

    #[test]
    fn test_initialize_is_deterministic() {
        let mesh = mesh(4, 2);
        let a = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        let b = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        assert_eq!(a.materialize().unwrap(), b.materialize().unwrap());

        let c = TrainState::initialize(&specs(), &mesh, &rules(), 18).unwrap();
        assert_ne!(a.materialize().unwrap(), c.materialize().unwrap());
    }

    #[test]
    fn test_initialize_is_mesh_independent() {
        let wide = TrainState::initialize(&specs(), &mesh(4, 2), &rules(), 17).unwrap();
        let narrow = TrainState::initialize(&specs(), &mesh(2, 2), &rules(), 17).unwrap();
        let a = wide.materialize().unwrap();
        let b = narrow.materialize().unwrap();
        assert_eq!(a.params, b.params);
    }

    #[test]
    fn test_apply_update_and_step_tracking() {
        let mesh = mesh(4, 2);
        let mut state = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        assert_eq!(state.step(), 0);

        let updates = vec![
            ("kernel".to_string(), vec![1.0f32; 32]),
            ("bias".to_string(), vec![-1.0f32; 4]),
        ];
        state.apply_update(&updates).unwrap();
        assert_eq!(state.advance_step(), 1);
        state.verify_replica_consistency().unwrap();

        let err = state
            .apply_update(&[("missing".to_string(), vec![0.0f32; 4])])
            .unwrap_err();
        assert!(matches!(err, Error::ParameterNotFound { .. }));
    }

    #[test]
    fn test_round_trip_same_mesh_is_bit_identical() {
        let mesh = mesh(4, 2);
        let mut state = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        state
            .apply_update(&[("kernel".to_string(), vec![0.25f32; 32])])
            .unwrap();
        state.advance_step();

        let payload = state.materialize().unwrap();
        let restored = TrainState::rehydrate(&payload, &specs(), &mesh, &rules()).unwrap();

        assert_eq!(restored.step(), 1);
        for (orig, back) in state.parameters().iter().zip(restored.parameters()) {
            for device in 0..mesh.device_count() {
                assert_eq!(orig.shard(device), back.shard(device));
            }
        }
    }

    #[test]
    fn test_rehydrate_reshards_onto_new_topology() {
        let source_mesh = mesh(4, 2);
        let mut state = TrainState::initialize(&specs(), &source_mesh, &rules(), 17).unwrap();
        state
            .apply_update(&[("kernel".to_string(), vec![0.5f32; 32])])
            .unwrap();
        let payload = state.materialize().unwrap();

        // Fewer devices, different shard boundaries.
        let target_mesh = mesh(2, 1);
        let restored =
            TrainState::rehydrate(&payload, &specs(), &target_mesh, &rules()).unwrap();

        assert_eq!(restored.materialize().unwrap().params, payload.params);
        let kernel = restored.parameter("kernel").unwrap();
        assert_eq!(kernel.layout().shard_shape(), &[4, 4]);
    }

    #[test]
    fn test_rehydrate_rejects_shape_change() {
        let mesh = mesh(4, 2);
        let state = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        let payload = state.materialize().unwrap();

        let grown = vec![
            ParameterSpec::new("kernel", vec![16, 4], vec!["batch", "embed"]),
            ParameterSpec::new("bias", vec![4], vec!["embed"]),
        ];
        let err = TrainState::rehydrate(&payload, &grown, &mesh, &rules()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { name, .. } if name == "kernel"));
    }

    #[test]
    fn test_rehydrate_rejects_unknown_parameter() {
        let mesh = mesh(4, 2);
        let state = TrainState::initialize(&specs(), &mesh, &rules(), 17).unwrap();
        let payload = state.materialize().unwrap();

        let fewer = vec![ParameterSpec::new(
            "kernel",
            vec![8, 4],
            vec!["batch", "embed"],
        )];
        let err = TrainState::rehydrate(&payload, &fewer, &mesh, &rules()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
