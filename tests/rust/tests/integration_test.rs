use anyhow::Result;
use checkpoint::artifact;
use orchestrator::{start_or_resume, RunRegistry};
use runtime_core::config::TrainingConfig;
use runtime_core::StopReason;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;
use train_state::CheckpointPayload;

// Geometry small enough that a whole run finishes in well under a second.
const CONFIG_YML: &str = r#"
run_name: lifecycle
seed: 11
mesh:
  device_count: 4
  axes:
    - name: data
      size: 2
    - name: model
      size: 2
model:
  base_emb_dim: 8
  base_num_heads: 2
  base_mlp_dim: 16
  base_num_decoder_layers: 1
  head_dim: 4
  vocab_size: 64
data:
  per_device_batch_size: 2
  max_target_length: 8
schedule:
  steps: 6
  log_period: 2
checkpoint:
  save_period: 2
"#;

// Load the config the way the binary does: a YAML file plus key=value
// overrides on top.
fn load_config(dir: &TempDir, extra: &[(&str, &str)]) -> Result<TrainingConfig> {
    let path = dir.path().join("config.yml");
    std::fs::write(&path, CONFIG_YML)?;

    let mut overrides = vec![(
        "base_output_directory".to_string(),
        dir.path().display().to_string(),
    )];
    for (key, value) in extra {
        overrides.push((key.to_string(), value.to_string()));
    }
    Ok(TrainingConfig::from_file(&path, &overrides)?)
}

fn metrics_lines(dir: &TempDir, run_name: &str) -> Result<Vec<serde_json::Value>> {
    let path = dir.path().join(run_name).join("metrics/metrics.jsonl");
    let raw = std::fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for line in raw.lines() {
        lines.push(serde_json::from_str(line)?);
    }
    Ok(lines)
}

#[tokio::test]
async fn test_full_training_flow() -> Result<()> {
    let dir = TempDir::new()?;

    // 1. Load the run configuration from disk with overrides applied
    let config = load_config(&dir, &[])?;
    assert_eq!(config.schedule.steps, 6);

    // 2. Resolve the run identity through the registry
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve(&config.run_name)?;

    // 3. Assemble the session; the directory is empty, so it starts fresh
    let handle = start_or_resume(run, config).await?;
    assert_eq!(handle.resumed_from(), None);

    // 4. Drive the loop to completion
    let summary = handle.run_to_completion().await?;
    assert_eq!(summary.final_step, 6);
    assert_eq!(summary.steps_this_session, 6);
    assert_eq!(summary.checkpoints_published, 3);
    assert_eq!(summary.stop_reason, StopReason::Completed);

    // 5. The checkpoint directory holds exactly the published artifacts,
    //    with no temp files left behind and the lock released
    let storage = LocalStorage::new(dir.path());
    let listed = storage.list("lifecycle/checkpoints/").await?;
    let artifacts: Vec<String> = listed
        .iter()
        .filter(|p| p.ends_with(".ckpt"))
        .cloned()
        .collect();
    assert_eq!(
        artifacts,
        vec![
            "lifecycle/checkpoints/step-00000002.ckpt".to_string(),
            "lifecycle/checkpoints/step-00000004.ckpt".to_string(),
            "lifecycle/checkpoints/step-00000006.ckpt".to_string(),
        ]
    );
    assert!(!listed.iter().any(|p| p.ends_with(".tmp")));
    assert!(!listed.iter().any(|p| p.ends_with(".lock")));

    // 6. Step metrics landed as one JSON object per logged step
    let lines = metrics_lines(&dir, "lifecycle")?;
    let steps: Vec<u64> = lines
        .iter()
        .map(|line| line["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![0, 2, 4]);
    for line in &lines {
        assert!(line["loss"].as_f64().unwrap().is_finite());
        assert!(line["learning_rate"].as_f64().unwrap() > 0.0);
    }

    Ok(())
}

#[tokio::test]
async fn test_second_session_resumes_from_newest_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;

    // First session runs 6 steps and checkpoints at 2, 4, 6.
    let config = load_config(&dir, &[])?;
    let registry = RunRegistry::new(dir.path());
    let run = registry.resolve("lifecycle")?;
    let first = start_or_resume(run.clone(), config)
        .await?
        .run_to_completion()
        .await?;
    assert_eq!(first.final_step, 6);

    // The rerun picks up at 6 and executes only the remaining steps.
    let config = load_config(&dir, &[("schedule.steps", "10")])?;
    let handle = start_or_resume(run, config).await?;
    assert_eq!(handle.resumed_from(), Some(6));
    let second = handle.run_to_completion().await?;
    assert_eq!(second.final_step, 10);
    assert_eq!(second.steps_this_session, 4);
    assert_eq!(second.checkpoints_published, 2);
    assert_eq!(second.stop_reason, StopReason::Completed);

    // The newest artifact carries the full state at step 10.
    let storage = LocalStorage::new(dir.path());
    let key = format!("lifecycle/checkpoints/{}", artifact::file_name(10));
    let data = storage.read(&key).await?;
    let decoded = artifact::decode(&key, &data)?;
    assert_eq!(decoded.step, 10);

    let payload = CheckpointPayload::from_bytes(&decoded.payload)?;
    assert_eq!(payload.step, 10);
    assert!(!payload.params.is_empty());

    // Metrics from both sessions share one append-only file.
    let lines = metrics_lines(&dir, "lifecycle")?;
    let steps: Vec<u64> = lines
        .iter()
        .map(|line| line["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![0, 2, 4, 6, 8]);

    Ok(())
}
