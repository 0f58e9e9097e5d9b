//! Run name resolution
//!
//! A run name maps to a fixed directory layout under the output root.
//! The resolved identity is an explicit value handed to every
//! collaborator; nothing in this module is process-global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use runtime_core::{Error, Result};
use tracing::debug;

/// Directory layout of one training run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub run_name: String,
    pub output_root: PathBuf,
    pub run_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl RunIdentity {
    /// Storage key prefix for checkpoint artifacts, relative to the
    /// output root
    pub fn checkpoint_prefix(&self) -> String {
        format!("{}/checkpoints", self.run_name)
    }

    /// Storage key prefix for metrics files, relative to the output root
    pub fn metrics_prefix(&self) -> String {
        format!("{}/metrics", self.run_name)
    }
}

/// Resolves run names into directory identities
///
/// Two resolves of the same name within one process share one identity.
pub struct RunRegistry {
    output_root: PathBuf,
    runs: DashMap<String, Arc<RunIdentity>>,
    name_pattern: Regex,
}

impl RunRegistry {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            runs: DashMap::new(),
            // Names become path components, so restrict to safe characters
            name_pattern: Regex::new(r"^[A-Za-z0-9._-]+$").unwrap(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Resolve a run name, validating it first
    pub fn resolve(&self, run_name: &str) -> Result<Arc<RunIdentity>> {
        if run_name.is_empty() {
            return Err(Error::InvalidRunName {
                name: run_name.to_string(),
                reason: "name is empty".to_string(),
            });
        }
        if !self.name_pattern.is_match(run_name) {
            return Err(Error::InvalidRunName {
                name: run_name.to_string(),
                reason: "allowed characters are letters, digits, '.', '_' and '-'".to_string(),
            });
        }
        if run_name.contains("..") {
            return Err(Error::InvalidRunName {
                name: run_name.to_string(),
                reason: "traversal sequences are not allowed".to_string(),
            });
        }

        let identity = self
            .runs
            .entry(run_name.to_string())
            .or_insert_with(|| {
                let run_dir = self.output_root.join(run_name);
                debug!(run = %run_name, dir = %run_dir.display(), "Resolved run identity");
                Arc::new(RunIdentity {
                    run_name: run_name.to_string(),
                    output_root: self.output_root.clone(),
                    checkpoint_dir: run_dir.join("checkpoints"),
                    metrics_dir: run_dir.join("metrics"),
                    run_dir,
                })
            })
            .clone();
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_builds_directory_layout() {
        let registry = RunRegistry::new("/tmp/meshrun");
        let identity = registry.resolve("alpha-7").unwrap();

        assert_eq!(identity.run_name, "alpha-7");
        assert_eq!(identity.run_dir, PathBuf::from("/tmp/meshrun/alpha-7"));
        assert_eq!(
            identity.checkpoint_dir,
            PathBuf::from("/tmp/meshrun/alpha-7/checkpoints")
        );
        assert_eq!(
            identity.metrics_dir,
            PathBuf::from("/tmp/meshrun/alpha-7/metrics")
        );
        assert_eq!(identity.checkpoint_prefix(), "alpha-7/checkpoints");
        assert_eq!(identity.metrics_prefix(), "alpha-7/metrics");
    }

    #[test]
    fn test_same_name_shares_identity() {
        let registry = RunRegistry::new("/tmp/meshrun");
        let first = registry.resolve("alpha").unwrap();
        let second = registry.resolve("alpha").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = registry.resolve("beta").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = RunRegistry::new("/tmp/meshrun");
        assert!(matches!(
            registry.resolve(""),
            Err(Error::InvalidRunName { .. })
        ));
    }

    #[test]
    fn test_unsafe_names_rejected() {
        let registry = RunRegistry::new("/tmp/meshrun");
        for name in ["../escape", "..", "a/b", "run name", "run\0"] {
            assert!(
                matches!(registry.resolve(name), Err(Error::InvalidRunName { .. })),
                "accepted {name:?}"
            );
        }
    }
}
