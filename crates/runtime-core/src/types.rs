//! Core type definitions for the training orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Training step counter
///
/// A checkpoint labelled with step `n` holds the state after `n` completed
/// steps, so a run resumed from it executes step index `n` next.
pub type Step = u64;

/// Linear device index within a mesh, row-major over the axis order
pub type DeviceId = usize;

/// Record for one published checkpoint artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Completed-step count the artifact holds
    pub step: Step,

    /// Storage path of the artifact
    pub path: String,

    /// Artifact size in bytes
    pub size_bytes: u64,

    /// Timestamp when the artifact was published
    pub created_at: DateTime<Utc>,
}

/// Scalar metrics emitted after each training step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Step index that was executed
    pub step: Step,

    /// Training loss
    pub loss: f64,

    /// Learning rate used for this step
    pub learning_rate: f64,

    /// Wall-clock duration of the step in milliseconds
    pub step_time_ms: f64,

    /// Tokens processed per second, when the batch size is known
    pub tokens_per_second: Option<f64>,
}

/// A periodic trigger anchored at multiples of `period`
///
/// A period of zero disables the trigger entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    period: u64,
}

impl Cadence {
    /// Create a cadence firing every `period` counts
    pub fn every(period: u64) -> Self {
        Self { period }
    }

    /// Returns true if this cadence never fires
    pub fn is_disabled(&self) -> bool {
        self.period == 0
    }

    /// The configured period, zero when disabled
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Returns true when `count` lands on the cadence
    pub fn fires_at(&self, count: u64) -> bool {
        self.period != 0 && count % self.period == 0
    }
}

/// Why a training loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// All configured steps were executed
    Completed,

    /// A graceful stop was requested and honored at a step boundary
    StopRequested,
}

/// Summary of a finished training session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run this session belonged to
    pub run_name: String,

    /// Completed-step count when the loop exited
    pub final_step: Step,

    /// Steps executed by this session (excludes steps restored from a
    /// checkpoint)
    pub steps_this_session: u64,

    /// Step the session resumed from, if it did not start fresh
    pub resumed_from: Option<Step>,

    /// Checkpoints published by this session
    pub checkpoints_published: u64,

    /// Why the loop returned
    pub stop_reason: StopReason,
}
