//! Logical-axis rule tables

use runtime_core::config::RuleEntry;
use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::spec::MeshSpec;

/// One rule mapping a logical tensor-dimension name to mesh axes
///
/// An empty axis list pins the dimension to replication even under a
/// strict unmatched policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRule {
    pub logical: String,
    pub mesh_axes: Vec<String>,
}

impl AxisRule {
    pub fn new(logical: impl Into<String>, mesh_axes: Vec<String>) -> Self {
        Self {
            logical: logical.into(),
            mesh_axes,
        }
    }
}

/// Policy for logical dimensions no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedPolicy {
    /// Treat unmatched dimensions as replicated
    Replicate,

    /// Fail resolution for unmatched dimensions
    Error,
}

/// Ordered first-match-wins rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    rules: Vec<AxisRule>,
    unmatched: UnmatchedPolicy,
}

impl RuleTable {
    pub fn new(rules: Vec<AxisRule>) -> Self {
        Self {
            rules,
            unmatched: UnmatchedPolicy::Replicate,
        }
    }

    pub fn with_unmatched_policy(mut self, unmatched: UnmatchedPolicy) -> Self {
        self.unmatched = unmatched;
        self
    }

    /// Build a table from configuration entries, keeping their order
    pub fn from_entries(entries: &[RuleEntry]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|entry| AxisRule::new(entry.logical.clone(), entry.mesh.clone()))
                .collect(),
        )
    }

    pub fn rules(&self) -> &[AxisRule] {
        &self.rules
    }

    pub fn unmatched_policy(&self) -> UnmatchedPolicy {
        self.unmatched
    }

    /// Check that every mesh axis the table references exists in `mesh`
    pub fn validate(&self, mesh: &MeshSpec) -> Result<()> {
        for rule in &self.rules {
            for axis in &rule.mesh_axes {
                if mesh.axis_index(axis).is_none() {
                    return Err(Error::UnknownMeshAxis { axis: axis.clone() });
                }
            }
        }
        Ok(())
    }

    /// Resolve one logical dimension name to the mesh axes it shards over
    ///
    /// The first rule whose logical name matches wins. Returns an empty
    /// slice for replicated dimensions.
    pub fn resolve<'a>(&'a self, logical: &str, mesh: &MeshSpec) -> Result<&'a [String]> {
        for rule in &self.rules {
            if rule.logical == logical {
                for axis in &rule.mesh_axes {
                    if mesh.axis_index(axis).is_none() {
                        return Err(Error::UnknownMeshAxis { axis: axis.clone() });
                    }
                }
                return Ok(&rule.mesh_axes);
            }
        }
        match self.unmatched {
            UnmatchedPolicy::Replicate => Ok(&[]),
            UnmatchedPolicy::Error => Err(Error::UnmatchedLogicalDim {
                logical: logical.to_string(),
            }),
        }
    }
}
