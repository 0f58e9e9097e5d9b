//! The training loop
//!
//! Drives batches through the executor one step at a time. Logging and
//! eval anchor on the executing step index; checkpoint saves anchor on
//! the completed-step count. Stop requests are honored at step
//! boundaries only, and in-flight saves are flushed before the loop
//! returns.

use bytes::Bytes;
use checkpoint::{ArtifactManifest, CheckpointManager, ParameterShape};
use data_pipeline::{Batch, BatchSource};
use runtime_core::config::TrainingConfig;
use runtime_core::{Cadence, Error, Result, RunSummary, Step, StopReason};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use train_state::TrainState;

use crate::executor::StepExecutor;
use crate::metrics::MetricsSink;

/// Evaluation hook turning held-out batches into a scalar loss
pub type EvalFn = Box<dyn FnMut(&TrainState, &[Batch]) -> Result<f64> + Send>;

/// Drives one training session from its resume point to completion
pub struct TrainLoopScheduler {
    pub(crate) run_name: String,
    pub(crate) config: TrainingConfig,
    pub(crate) state: TrainState,
    pub(crate) source: Box<dyn BatchSource>,
    pub(crate) executor: Box<dyn StepExecutor>,
    pub(crate) sinks: Vec<Box<dyn MetricsSink>>,
    pub(crate) eval: Option<(Box<dyn BatchSource>, EvalFn)>,
    pub(crate) manager: Option<CheckpointManager>,
    pub(crate) resumed_from: Option<Step>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl TrainLoopScheduler {
    /// Run until all steps complete or a stop request lands
    ///
    /// An executor error aborts immediately with the state uncommitted
    /// and the run directory still locked; a stop request drains
    /// in-flight saves and releases the lock like normal completion.
    pub async fn run(mut self) -> Result<RunSummary> {
        let resume_step = self.state.step();
        let total_steps = self.config.schedule.steps;
        let log_cadence = Cadence::every(self.config.schedule.log_period);
        let eval_cadence = Cadence::every(self.config.schedule.eval_period);

        // The source replays the exact step sequence an uninterrupted
        // run would have seen.
        self.source.seek(resume_step);

        info!(
            run = %self.run_name,
            resume_step,
            total_steps,
            "Starting training loop"
        );

        let mut stop_reason = StopReason::Completed;
        for step in resume_step..total_steps {
            if *self.stop.borrow() {
                info!(step, "Stop requested, leaving training loop");
                stop_reason = StopReason::StopRequested;
                break;
            }

            let batch = self.source.next_batch()?;
            let metrics = match self.executor.execute(&mut self.state, &batch) {
                Ok(metrics) => metrics,
                Err(e) => {
                    error!(step, error = %e, "Step execution failed, aborting run");
                    return Err(step_failure(step, e));
                }
            };
            self.state.advance_step();

            if log_cadence.fires_at(step) {
                for sink in &mut self.sinks {
                    if let Err(e) = sink.record(&metrics) {
                        warn!(step, sink = sink.name(), error = %e, "Metrics sink failed");
                    }
                }
            }

            let completed = self.state.step();
            if let Some(manager) = &self.manager {
                let queued = manager
                    .maybe_save(completed, || snapshot(&self.run_name, &self.state))
                    .await?;
                if queued {
                    debug!(step = completed, "Queued checkpoint save");
                }
            }

            if eval_cadence.fires_at(step) {
                self.run_eval(step);
            }
        }

        let checkpoints_published = match self.manager.take() {
            Some(manager) => {
                manager.wait_pending().await?;
                let published = manager.published_count();
                manager.close().await?;
                published
            }
            None => 0,
        };

        let final_step = self.state.step();
        let steps_this_session = final_step - resume_step;
        info!(
            run = %self.run_name,
            final_step,
            steps_this_session,
            checkpoints_published,
            reason = ?stop_reason,
            "Training loop finished"
        );

        Ok(RunSummary {
            run_name: self.run_name,
            final_step,
            steps_this_session,
            resumed_from: self.resumed_from,
            checkpoints_published,
            stop_reason,
        })
    }

    /// Run one evaluation pass; failures are logged, never fatal
    fn run_eval(&mut self, step: Step) {
        let Some((source, eval)) = self.eval.as_mut() else {
            return;
        };

        // Same held-out batches every pass
        source.seek(0);
        let mut batches = Vec::with_capacity(self.config.schedule.eval_batches as usize);
        for _ in 0..self.config.schedule.eval_batches {
            match source.next_batch() {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    warn!(step, error = %e, "Evaluation batch fetch failed");
                    return;
                }
            }
        }

        match eval(&self.state, &batches) {
            Ok(eval_loss) => info!(step, eval_loss, "Evaluation complete"),
            Err(e) => warn!(step, error = %e, "Evaluation failed"),
        }
    }
}

/// Materialize the state into a manifest plus payload for saving
fn snapshot(run_name: &str, state: &TrainState) -> Result<(ArtifactManifest, Bytes)> {
    let shapes = state
        .parameters()
        .iter()
        .map(|param| ParameterShape {
            name: param.name().to_string(),
            global_shape: param.spec().global_shape.clone(),
        })
        .collect();
    let manifest = ArtifactManifest::new(run_name, state.mesh(), state.rules(), shapes);
    let payload = state.materialize()?.to_bytes()?;
    Ok((manifest, payload))
}

/// Present an executor error as the collective step failure it is
fn step_failure(step: Step, error: Error) -> Error {
    match error {
        collective @ Error::Collective { .. } => collective,
        other => Error::Collective {
            step,
            message: other.to_string(),
        },
    }
}
