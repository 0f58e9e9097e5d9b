//! End-to-end checkpoint lifecycle tests
//!
//! These exercise full sessions through the orchestrator API and the
//! checkpoint manager together:
//! - Retention over a long run, tail keeps plus milestone keeps
//! - Crash leftovers (truncated artifact, stray temp file) at resume
//! - Graceful stop partway through a run, then resume to the same state
//! - Stale lock recovery via force-unlock
//! - Parked deletion retry after backend failures

use anyhow::Result;
use bytes::Bytes;
use checkpoint::{artifact, ArtifactManifest, CheckpointManager};
use mesh::{AxisRule, MeshAxis, MeshSpec, RuleTable};
use orchestrator::{start_or_resume, RunRegistry};
use runtime_core::config::{CheckpointSettings, RetryConfig, TrainingConfig};
use runtime_core::{Error, RunSummary, StopReason};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;
use tokio::time::sleep;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_manifest() -> ArtifactManifest {
    let mesh = MeshSpec::build(vec![MeshAxis::new("data", 2).unwrap()], 2).unwrap();
    let rules = RuleTable::new(vec![AxisRule::new("batch", vec!["data".to_string()])]);
    ArtifactManifest::new("e2e-run", &mesh, &rules, Vec::new())
}

fn fast_settings(save_period: u64, max_to_keep: u64, keep_period: u64) -> CheckpointSettings {
    CheckpointSettings {
        enabled: true,
        save_period,
        max_to_keep,
        keep_period,
        queue_depth: 4,
        retry: RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    }
}

fn small_config(dir: &TempDir, run_name: &str, steps: u64) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.run_name = run_name.to_string();
    config.base_output_directory = dir.path().display().to_string();
    config.seed = 17;
    config.mesh.device_count = 4;
    config.mesh.axes[0].size = 2;
    config.mesh.axes[1].size = 2;
    config.model.base_emb_dim = 8;
    config.model.base_num_heads = 2;
    config.model.base_mlp_dim = 16;
    config.model.base_num_decoder_layers = 1;
    config.model.head_dim = 4;
    config.model.vocab_size = 64;
    config.data.per_device_batch_size = 2;
    config.data.max_target_length = 8;
    config.schedule.steps = steps;
    config.schedule.log_period = 2;
    config.checkpoint.save_period = 2;
    config
}

async fn run_session(dir: &TempDir, run_name: &str, steps: u64) -> Result<RunSummary> {
    let config = small_config(dir, run_name, steps);
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve(run_name)?;
    let handle = start_or_resume(run, config).await?;
    Ok(handle.run_to_completion().await?)
}

async fn final_payload(dir: &TempDir, run_name: &str, step: u64) -> Result<Bytes> {
    let storage = LocalStorage::new(dir.path());
    let key = format!("{run_name}/checkpoints/{}", artifact::file_name(step));
    let data = storage.read(&key).await?;
    Ok(artifact::decode(&key, &data)?.payload)
}

#[tokio::test]
async fn test_retention_policy_over_long_run() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));

    // Save every 1000 steps, keep the last 10, and additionally keep
    // every multiple of 10000.
    let manager = CheckpointManager::open(
        "long/checkpoints",
        fast_settings(1000, 10, 10_000),
        storage.clone(),
    )
    .await?;

    let manifest = test_manifest();
    for completed in 1..=25_000u64 {
        manager
            .maybe_save(completed, || {
                Ok((manifest.clone(), Bytes::from_static(b"state")))
            })
            .await?;
    }
    manager.wait_pending().await?;

    let mut expected: Vec<u64> = (16..=25).map(|k| k * 1000).collect();
    expected.insert(0, 10_000);
    assert_eq!(manager.retained_steps(), expected);

    // Pruned artifacts are gone from disk as well.
    let listed = storage.list("long/checkpoints/").await?;
    let on_disk: Vec<String> = listed
        .iter()
        .filter(|p| p.ends_with(".ckpt"))
        .cloned()
        .collect();
    let expected_files: Vec<String> = expected
        .iter()
        .map(|step| format!("long/checkpoints/{}", artifact::file_name(*step)))
        .collect();
    assert_eq!(on_disk, expected_files);

    manager.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_crash_leftovers_do_not_block_resume() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;

    // A run that checkpointed at steps 2 and 4.
    let summary = run_session(&dir, "recover", 4).await?;
    assert_eq!(summary.checkpoints_published, 2);

    // Simulate a crash mid-write: truncate the newest artifact and leave
    // a stray temp file next to it.
    let storage = LocalStorage::new(dir.path());
    let newest = format!("recover/checkpoints/{}", artifact::file_name(4));
    let bytes = storage.read(&newest).await?;
    storage
        .write(&newest, bytes.slice(..bytes.len() / 2))
        .await?;
    storage
        .write(
            "recover/checkpoints/.step-00000006.ckpt.9999.tmp",
            Bytes::from_static(b"junk"),
        )
        .await?;

    // The next session falls back to step 2 and still reaches step 8.
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve("recover")?;
    let config = small_config(&dir, "recover", 8);
    let handle = start_or_resume(run, config).await?;
    assert_eq!(handle.resumed_from(), Some(2));
    let summary = handle.run_to_completion().await?;
    assert_eq!(summary.final_step, 8);
    assert_eq!(summary.stop_reason, StopReason::Completed);

    // The final state is identical to a run that was never disturbed.
    let solo = run_session(&dir, "solo", 8).await?;
    assert_eq!(solo.final_step, 8);
    assert_eq!(
        final_payload(&dir, "recover", 8).await?,
        final_payload(&dir, "solo", 8).await?
    );
    Ok(())
}

#[tokio::test]
async fn test_interrupted_session_resumes_to_identical_state() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;

    // A long session stopped somewhere in the middle from another task,
    // the way the ctrl-c handler does it.
    let config = small_config(&dir, "halted", 40);
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve("halted")?;
    let handle = start_or_resume(run.clone(), config).await?;
    let stop = handle.stop_handle();
    let running = tokio::spawn(handle.run_to_completion());

    // Ask for a graceful stop once the first checkpoint is on disk.
    let first_ckpt = dir.path().join("halted/checkpoints/step-00000002.ckpt");
    for _ in 0..500 {
        if first_ckpt.exists() {
            break;
        }
        sleep(Duration::from_millis(2)).await;
    }
    stop.request_stop();
    let interrupted = running.await??;
    assert!(interrupted.checkpoints_published >= 1);
    assert!(interrupted.final_step <= 40);

    // The lock was released, so the rerun resumes and finishes the rest.
    let config = small_config(&dir, "halted", 40);
    let handle = start_or_resume(run, config).await?;
    assert!(handle.resumed_from().is_some());
    let finished = handle.run_to_completion().await?;
    assert_eq!(finished.final_step, 40);

    // Byte-identical to a run that never stopped.
    let solo = run_session(&dir, "straight", 40).await?;
    assert_eq!(solo.final_step, 40);
    assert_eq!(
        final_payload(&dir, "halted", 40).await?,
        final_payload(&dir, "straight", 40).await?
    );
    Ok(())
}

#[tokio::test]
async fn test_stale_lock_force_unlock_flow() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let storage = LocalStorage::new(dir.path());

    // A lock left behind by a process that died without closing.
    let stale = serde_json::json!({
        "owner": "07bffa63-43f0-4b1a-9cf5-6c3a33b24d7e",
        "pid": 4242,
        "hostname": "worker-gone",
        "created_at": "2026-08-20T12:00:00Z",
    });
    storage
        .write(
            "stuck/checkpoints/.lock",
            Bytes::from(serde_json::to_vec(&stale)?),
        )
        .await?;

    // Starting the run reports the conflict instead of taking over.
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve("stuck")?;
    let config = small_config(&dir, "stuck", 4);
    let err = start_or_resume(run.clone(), config.clone()).await.unwrap_err();
    assert!(matches!(err, Error::RunLocked { .. }));

    // The operator clears it explicitly, and the run proceeds.
    CheckpointManager::force_unlock(&storage, "stuck/checkpoints").await?;
    let summary = start_or_resume(run, config)
        .await?
        .run_to_completion()
        .await?;
    assert_eq!(summary.final_step, 4);
    Ok(())
}

/// Delegates to local storage but fails artifact deletions on demand
struct StickyStorage {
    inner: LocalStorage,
    fail_deletes: AtomicBool,
}

#[async_trait::async_trait]
impl StorageBackend for StickyStorage {
    async fn read(&self, path: &str) -> runtime_core::Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> runtime_core::Result<u64> {
        self.inner.write(path, data).await
    }

    async fn write_if_absent(&self, path: &str, data: Bytes) -> runtime_core::Result<bool> {
        self.inner.write_if_absent(path, data).await
    }

    async fn delete(&self, path: &str) -> runtime_core::Result<()> {
        if path.ends_with(".ckpt") && self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Storage {
                message: "injected delete failure".to_string(),
            });
        }
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> runtime_core::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> runtime_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

#[tokio::test]
async fn test_failed_deletions_park_and_retry() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let storage = Arc::new(StickyStorage {
        inner: LocalStorage::new(dir.path()),
        fail_deletes: AtomicBool::new(false),
    });

    // Keep only the newest checkpoint so every publish prunes the
    // previous one.
    let manager =
        CheckpointManager::open("sticky/checkpoints", fast_settings(1, 1, 0), storage.clone())
            .await?;
    let manifest = test_manifest();

    manager
        .maybe_save(1, || Ok((manifest.clone(), Bytes::from_static(b"one"))))
        .await?;
    manager.wait_pending().await?;

    // The prune after the next publish cannot delete, so the path parks.
    storage.fail_deletes.store(true, Ordering::SeqCst);
    manager
        .maybe_save(2, || Ok((manifest.clone(), Bytes::from_static(b"two"))))
        .await?;
    manager.wait_pending().await?;
    assert_eq!(manager.parked_deletion_count(), 1);
    assert!(storage.exists("sticky/checkpoints/step-00000001.ckpt").await?);
    assert_eq!(manager.retained_steps(), vec![2]);

    // Once the backend recovers, the next pass clears the backlog.
    storage.fail_deletes.store(false, Ordering::SeqCst);
    manager
        .maybe_save(3, || Ok((manifest.clone(), Bytes::from_static(b"three"))))
        .await?;
    manager.wait_pending().await?;
    assert_eq!(manager.parked_deletion_count(), 0);
    assert!(!storage.exists("sticky/checkpoints/step-00000001.ckpt").await?);
    assert!(!storage.exists("sticky/checkpoints/step-00000002.ckpt").await?);
    assert_eq!(manager.retained_steps(), vec![3]);

    manager.close().await?;
    Ok(())
}
