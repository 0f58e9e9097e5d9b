//! Train State - Sharded model state and its checkpoint form
//!
//! A `TrainState` owns the step counter and every parameter, each split
//! into per-device shards according to the mesh and rule table. State
//! crosses process boundaries only as a `CheckpointPayload`, which stores
//! full global arrays so a restart may re-shard onto a different mesh.

pub mod model;
pub mod param;
pub mod payload;
pub mod store;

pub use model::model_parameter_specs;
pub use param::{ParameterSpec, ShardedParameter};
pub use payload::{CheckpointPayload, ParameterPayload};
pub use store::TrainState;
