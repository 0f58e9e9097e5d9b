//! Training binary entry point
//!
//! Usage:
//!   meshrun <config.yml> [key=value ...]
//!   meshrun force-unlock <config.yml> [key=value ...]
//!
//! Overrides patch the YAML file the same way command-line arguments
//! patch the original hyperparameter files: the key must exist and the
//! value is parsed with the type found in the file.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkpoint::CheckpointManager;
use orchestrator::{build_storage, start_or_resume, RunRegistry};
use runtime_core::TrainingConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator=info,checkpoint=info,runtime_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let force_unlock = args.first().map(String::as_str) == Some("force-unlock");
    if force_unlock {
        args.remove(0);
    }

    let Some(config_path) = args.first().cloned() else {
        eprintln!("usage: meshrun [force-unlock] <config.yml> [key=value ...]");
        std::process::exit(2);
    };

    let mut overrides = Vec::new();
    for arg in &args[1..] {
        match arg.split_once('=') {
            Some((key, value)) => overrides.push((key.to_string(), value.to_string())),
            None => {
                eprintln!("override must look like key=value, got {arg:?}");
                std::process::exit(2);
            }
        }
    }

    let config = TrainingConfig::from_file(&config_path, &overrides)?;

    if force_unlock {
        let storage = build_storage(&config).await?;
        CheckpointManager::force_unlock(storage.as_ref(), &config.checkpoint_prefix()).await?;
        tracing::info!(run = %config.run_name, "Lock removed");
        return Ok(());
    }

    let registry = RunRegistry::new(&config.base_output_directory);
    let identity = registry.resolve(&config.run_name)?;

    let handle = start_or_resume(identity, config).await?;

    // First Ctrl-C stops at the next step boundary after flushing saves.
    let stop = handle.stop_handle();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("Interrupt received, stopping at the next step boundary");
            stop.request_stop();
        }
    });

    let summary = handle.run_to_completion().await?;
    tracing::info!(
        run = %summary.run_name,
        final_step = summary.final_step,
        steps_this_session = summary.steps_this_session,
        checkpoints_published = summary.checkpoints_published,
        reason = ?summary.stop_reason,
        "Run finished"
    );

    Ok(())
}
