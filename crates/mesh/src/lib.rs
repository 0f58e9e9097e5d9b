//! Device mesh geometry and logical-axis sharding rules
//!
//! A mesh arranges the run's devices along named axes. A rule table maps
//! logical tensor-dimension names onto mesh axes, and a partition layout
//! turns a global array shape plus those rules into per-device shard
//! slices. Everything here is pure arithmetic over its inputs, so the same
//! configuration always produces the same sharding.

pub mod layout;
pub mod rules;
pub mod spec;

pub use layout::{PartitionLayout, ShardSlice};
pub use rules::{AxisRule, RuleTable, UnmatchedPolicy};
pub use spec::{MeshAxis, MeshDevice, MeshSpec};
