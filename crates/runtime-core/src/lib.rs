//! Runtime Core - Foundation for the training orchestrator
//!
//! Provides core types, error handling, and run configuration for the
//! mesh training and checkpoint system.

pub mod config;
pub mod error;
pub mod types;

pub use config::TrainingConfig;
pub use error::{Error, Result};
pub use types::*;
