//! Step-addressed batch sources

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::{Error, Result, Step};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One global batch of token ids, shaped `[rows, seq_len]` row-major
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Step this batch feeds
    pub step: Step,

    /// Rows in the global batch
    pub rows: usize,

    /// Tokens per row
    pub seq_len: usize,

    /// Token ids, `rows * seq_len` of them
    pub tokens: Vec<u32>,
}

impl Batch {
    /// One row of tokens
    pub fn row(&self, row: usize) -> &[u32] {
        &self.tokens[row * self.seq_len..(row + 1) * self.seq_len]
    }
}

/// A restartable, deterministic stream of batches
///
/// Sources are addressed by step: after `seek(s)` the next batch is the
/// batch for step `s`, identical to what an uninterrupted pass would
/// have produced at that step. This is what makes resume replay exact.
pub trait BatchSource: Send {
    /// Produce the batch for the current position and advance by one
    fn next_batch(&mut self) -> Result<Batch>;

    /// Reposition so the next batch is the one for `step`
    fn seek(&mut self, step: Step);

    /// Step the next batch will feed
    fn position(&self) -> Step;
}

/// Synthetic token batches, seeded per step
///
/// Each step's tokens come from their own ChaCha stream keyed by the
/// base seed and the step number, so seeking is O(1) and replay does
/// not depend on how many batches were drawn before.
#[derive(Debug, Clone)]
pub struct SyntheticTextSource {
    seed: u64,
    rows: usize,
    seq_len: usize,
    vocab_size: u32,
    next_step: Step,
}

impl SyntheticTextSource {
    pub fn new(seed: u64, rows: usize, seq_len: usize, vocab_size: u32) -> Result<Self> {
        if rows == 0 || seq_len == 0 {
            return Err(Error::InvalidConfig {
                message: format!("batch shape [{rows}, {seq_len}] must be non-empty"),
            });
        }
        if vocab_size == 0 {
            return Err(Error::InvalidConfig {
                message: "vocab_size must be positive".to_string(),
            });
        }
        Ok(Self {
            seed,
            rows,
            seq_len,
            vocab_size,
            next_step: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Per-step seed derived from the base seed
    fn batch_seed(&self, step: Step) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        step.hash(&mut hasher);
        hasher.finish()
    }
}

impl BatchSource for SyntheticTextSource {
    fn next_batch(&mut self) -> Result<Batch> {
        let step = self.next_step;
        let mut rng = ChaCha8Rng::seed_from_u64(self.batch_seed(step));
        let tokens = (0..self.rows * self.seq_len)
            .map(|_| rng.gen_range(0..self.vocab_size))
            .collect();

        self.next_step += 1;
        Ok(Batch {
            step,
            rows: self.rows,
            seq_len: self.seq_len,
            tokens,
        })
    }

    fn seek(&mut self, step: Step) {
        debug!(from = self.next_step, to = step, "Seeking batch source");
        self.next_step = step;
    }

    fn position(&self) -> Step {
        self.next_step
    }
}
