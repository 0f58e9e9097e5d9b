//! Step execution over sharded state

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use data_pipeline::Batch;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::config::OptimizerConfig;
use runtime_core::{Error, Result, Step, StepMetrics};
use train_state::TrainState;

/// One training step over the sharded state
///
/// Implementations mutate parameters shard-wise and must be
/// deterministic given the same state, batch, and sharding. The loop
/// treats any error as a collective failure and stops without
/// committing the step.
pub trait StepExecutor: Send {
    fn execute(&mut self, state: &mut TrainState, batch: &Batch) -> Result<StepMetrics>;
}

/// Deterministic stand-in for device compute
///
/// Pseudo-gradients come from a ChaCha stream keyed by the run seed,
/// the parameter name, the step, and a digest of the batch tokens, so
/// replaying the same steps over the same batches reproduces the state
/// bit for bit.
pub struct SyntheticExecutor {
    seed: u64,
    optimizer: OptimizerConfig,
}

impl SyntheticExecutor {
    pub fn new(seed: u64, optimizer: OptimizerConfig) -> Self {
        Self { seed, optimizer }
    }

    fn update_seed(&self, name: &str, step: Step, batch_digest: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        name.hash(&mut hasher);
        step.hash(&mut hasher);
        batch_digest.hash(&mut hasher);
        hasher.finish()
    }
}

impl StepExecutor for SyntheticExecutor {
    fn execute(&mut self, state: &mut TrainState, batch: &Batch) -> Result<StepMetrics> {
        let step = state.step();
        if batch.step != step {
            return Err(Error::Collective {
                step,
                message: format!("batch for step {} fed to step {}", batch.step, step),
            });
        }

        let started = Instant::now();
        let digest = token_digest(&batch.tokens);
        let learning_rate = self.optimizer.learning_rate_at(step);
        let scale = learning_rate as f32;

        let mut updates = Vec::with_capacity(state.parameters().len());
        for param in state.parameters() {
            let mut rng = ChaCha8Rng::seed_from_u64(self.update_seed(param.name(), step, digest));
            let delta: Vec<f32> = (0..param.spec().global_len())
                .map(|_| -scale * rng.gen_range(-1.0f32..=1.0))
                .collect();
            updates.push((param.name().to_string(), delta));
        }
        state.apply_update(&updates)?;

        let elapsed = started.elapsed().as_secs_f64();
        let tokens = batch.tokens.len() as f64;
        Ok(StepMetrics {
            step,
            loss: synthetic_loss(step, digest),
            learning_rate,
            step_time_ms: elapsed * 1000.0,
            tokens_per_second: (elapsed > 0.0).then_some(tokens / elapsed),
        })
    }
}

fn token_digest(tokens: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tokens.hash(&mut hasher);
    hasher.finish()
}

/// Smoothly decreasing pseudo-loss with per-batch variation
fn synthetic_loss(step: Step, digest: u64) -> f64 {
    let base = 8.0 / (1.0 + 0.1 * (step as f64).sqrt());
    let jitter = (digest % 1024) as f64 / 1024.0 * 0.05;
    base + jitter
}

/// Pseudo eval loss over a fixed set of held-out batches
pub fn synthetic_eval_loss(state: &TrainState, batches: &[Batch]) -> f64 {
    if batches.is_empty() {
        return 0.0;
    }
    let step = state.step();
    let total: f64 = batches
        .iter()
        .map(|batch| synthetic_loss(step, token_digest(&batch.tokens)))
        .sum();
    total / batches.len() as f64
}
