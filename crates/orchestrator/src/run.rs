//! Session assembly and the run handle
//!
//! `start_or_resume` wires one training session end to end: storage, the
//! checkpoint manager, the state (fresh or rehydrated from the newest
//! valid checkpoint), the batch source positioned at the resume step,
//! the executor, and the metrics sinks. The returned handle drives the
//! loop to completion and accepts graceful stop requests.

use std::sync::Arc;

use checkpoint::CheckpointManager;
use data_pipeline::{global_batch_rows, BatchSource, HostDataLayout, SyntheticTextSource};
use mesh::{MeshSpec, RuleTable};
use runtime_core::config::{StorageKind, TrainingConfig};
use runtime_core::{Result, RunSummary, Step};
use storage::{LocalStorage, StorageBackend};
use tokio::sync::watch;
use tracing::{info, warn};
use train_state::{model_parameter_specs, CheckpointPayload, ParameterSpec, TrainState};

use crate::executor::{synthetic_eval_loss, SyntheticExecutor};
use crate::metrics::{JsonlSink, MetricsSink, TracingSink};
use crate::registry::RunIdentity;
use crate::scheduler::{EvalFn, TrainLoopScheduler};

/// Offset separating the held-out token stream from the training stream
const EVAL_SEED_OFFSET: u64 = 1_000_003;

/// A running session, ready to be driven to completion
pub struct TrainHandle {
    scheduler: TrainLoopScheduler,
    stop: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for TrainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainHandle")
            .field("resumed_from", &self.scheduler.resumed_from)
            .finish_non_exhaustive()
    }
}

impl TrainHandle {
    /// Step this session resumed from, `None` for a fresh start
    pub fn resumed_from(&self) -> Option<Step> {
        self.scheduler.resumed_from
    }

    /// Clonable trigger usable from another task while the loop runs
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Request a graceful stop at the next step boundary
    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Drive the training loop until completion or a stop request
    pub async fn run_to_completion(self) -> Result<RunSummary> {
        self.scheduler.run().await
    }
}

/// Requests a graceful stop of a running session
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Assemble a training session for the given run
///
/// With checkpointing enabled this acquires the run's writer lock, scans
/// the checkpoint directory, and resumes from the newest valid artifact
/// when one exists; the state re-shards automatically if the mesh
/// changed since the checkpoint was written.
pub async fn start_or_resume(run: Arc<RunIdentity>, config: TrainingConfig) -> Result<TrainHandle> {
    config.validate()?;

    let mesh = MeshSpec::from_config(&config.mesh)?;
    let rules = RuleTable::from_entries(&config.mesh.logical_axis_rules);
    let specs = model_parameter_specs(&config.model);

    // Plan host loading up front so bad batch geometry fails before any
    // state is allocated.
    let global_rows = global_batch_rows(&mesh, &rules, config.data.per_device_batch_size)?;
    let host_layout = HostDataLayout::compute(&mesh, &rules, global_rows)?;
    info!(
        run = %run.run_name,
        mesh = %mesh.summary(),
        global_rows,
        processes = host_layout.hosts().len(),
        unique_loads = host_layout.num_unique_loads(),
        "Planned batch loading"
    );

    let storage = build_storage(&config).await?;

    let (manager, state, resumed_from) = if config.checkpoint.enabled {
        let manager = CheckpointManager::open(
            &run.checkpoint_prefix(),
            config.checkpoint.clone(),
            storage.clone(),
        )
        .await?;

        match restore_state(&manager, &specs, &mesh, &rules, config.seed).await {
            Ok((state, resumed_from)) => (Some(manager), state, resumed_from),
            Err(e) => {
                // A failed start must not strand the writer lock.
                let _ = manager.close().await;
                return Err(e);
            }
        }
    } else {
        info!(run = %run.run_name, "Checkpointing disabled, starting fresh");
        let state = TrainState::initialize(&specs, &mesh, &rules, config.seed)?;
        (None, state, None)
    };

    let source = SyntheticTextSource::new(
        config.seed,
        global_rows,
        config.data.max_target_length,
        config.model.vocab_size as u32,
    )?;

    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink)];
    match JsonlSink::create(&run.metrics_dir) {
        Ok(sink) => sinks.push(Box::new(sink)),
        Err(e) => {
            warn!(dir = %run.metrics_dir.display(), error = %e, "Metrics file sink unavailable")
        }
    }

    let eval = if config.schedule.eval_period > 0 {
        let eval_source = SyntheticTextSource::new(
            config.seed.wrapping_add(EVAL_SEED_OFFSET),
            global_rows,
            config.data.max_target_length,
            config.model.vocab_size as u32,
        )?;
        let eval_fn: EvalFn = Box::new(|state, batches| Ok(synthetic_eval_loss(state, batches)));
        Some((Box::new(eval_source) as Box<dyn BatchSource>, eval_fn))
    } else {
        None
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = TrainLoopScheduler {
        run_name: run.run_name.clone(),
        executor: Box::new(SyntheticExecutor::new(config.seed, config.optimizer.clone())),
        config,
        state,
        source: Box::new(source),
        sinks,
        eval,
        manager,
        resumed_from,
        stop: stop_rx,
    };

    Ok(TrainHandle {
        scheduler,
        stop: Arc::new(stop_tx),
    })
}

/// Load the resume state, or initialize fresh when the directory has no
/// usable checkpoint
async fn restore_state(
    manager: &CheckpointManager,
    specs: &[ParameterSpec],
    mesh: &MeshSpec,
    rules: &RuleTable,
    seed: u64,
) -> Result<(TrainState, Option<Step>)> {
    match manager.load_for_resume().await? {
        Some(artifact) => {
            let payload = CheckpointPayload::from_bytes(&artifact.payload)?;
            let state = TrainState::rehydrate(&payload, specs, mesh, rules)?;
            if artifact.manifest.mesh_axes.as_slice() != mesh.axes() {
                info!(
                    from = %artifact.manifest.mesh_summary(),
                    to = %mesh.summary(),
                    "Resharding checkpoint onto a different mesh"
                );
            }
            info!(step = artifact.step, "Resumed from checkpoint");
            Ok((state, Some(artifact.step)))
        }
        None => {
            let state = TrainState::initialize(specs, mesh, rules, seed)?;
            Ok((state, None))
        }
    }
}

/// Instantiate the artifact store the configuration selects
pub async fn build_storage(config: &TrainingConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.storage.backend {
        StorageKind::Local => Ok(Arc::new(LocalStorage::new(&config.base_output_directory))),
        StorageKind::S3 => s3_storage(config).await,
    }
}

#[cfg(feature = "s3")]
async fn s3_storage(config: &TrainingConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = storage::S3Storage::from_settings(&config.storage, "").await;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "s3"))]
async fn s3_storage(_config: &TrainingConfig) -> Result<Arc<dyn StorageBackend>> {
    Err(runtime_core::Error::StorageUnavailable {
        backend: "s3 (rebuild with the s3 feature)".to_string(),
    })
}
