//! Checkpoint lifecycle for training runs
//!
//! The artifact format, the async write-behind writer, and the manager
//! that owns a run directory's scan, cadence, retention, and recovery.

pub mod artifact;
pub mod manager;
pub mod writer;

pub use artifact::{Artifact, ArtifactManifest, ParameterShape};
pub use manager::{CheckpointManager, DirectoryState, LockInfo, PendingSave};
pub use writer::{CheckpointWriter, WriteRequest, WriterEvent};
