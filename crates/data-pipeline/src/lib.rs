//! Data Pipeline - Restartable batch sources and host-level sharding
//!
//! Batches are addressed by step, so a resumed run replays exactly the
//! sequence an uninterrupted run would have seen. The host layout
//! mirrors the sharding rules: it decides which contiguous rows of the
//! global batch each process loads and deduplicates identical loads.

pub mod host;
pub mod source;

pub use host::{global_batch_rows, DeviceRows, HostDataLayout, HostLoad};
pub use source::{Batch, BatchSource, SyntheticTextSource};
