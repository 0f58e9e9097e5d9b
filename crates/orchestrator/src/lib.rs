//! Orchestrator - run assembly and the training loop
//!
//! Ties the mesh, state, data pipeline, and checkpoint lifecycle into
//! one drivable session: resolve the run's identity, restore or
//! initialize state, then step batches through the executor while the
//! checkpoint manager saves on cadence in the background.

pub mod executor;
pub mod metrics;
pub mod registry;
pub mod run;
pub mod scheduler;

pub use executor::{synthetic_eval_loss, StepExecutor, SyntheticExecutor};
pub use metrics::{JsonlSink, MetricsSink, TracingSink};
pub use registry::{RunIdentity, RunRegistry};
pub use run::{build_storage, start_or_resume, StopHandle, TrainHandle};
pub use scheduler::{EvalFn, TrainLoopScheduler};
