//! Training run configuration
//!
//! Configuration is loaded from a YAML file and optionally patched by
//! `key=value` overrides (dotted paths for nested sections). Every override
//! key must already exist in the schema, and the override string is parsed
//! according to the type of the value it replaces.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run name, used as the directory component under the output root
    pub run_name: String,

    /// Root under which all runs store their artifacts
    pub base_output_directory: String,

    /// Base seed for parameter initialization and data generation
    pub seed: u64,

    /// Model dimension settings
    pub model: ModelConfig,

    /// Device mesh and sharding rules
    pub mesh: MeshSection,

    /// Step counts and cadences
    pub schedule: ScheduleConfig,

    /// Checkpoint lifecycle settings
    pub checkpoint: CheckpointSettings,

    /// Batch geometry
    pub data: DataConfig,

    /// Optimizer settings
    pub optimizer: OptimizerConfig,

    /// Storage backend selection
    pub storage: StorageSettings,

    /// Decode-time sampling defaults
    pub sampling: SamplingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_name: String::new(),
            base_output_directory: "/tmp/meshrun".to_string(),
            seed: 0,
            model: ModelConfig::default(),
            mesh: MeshSection::default(),
            schedule: ScheduleConfig::default(),
            checkpoint: CheckpointSettings::default(),
            data: DataConfig::default(),
            optimizer: OptimizerConfig::default(),
            storage: StorageSettings::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

/// Model dimensions, expressed as base sizes times a global scale
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Integer multiplier applied to every base dimension
    pub global_parameter_scale: u64,

    /// Base embedding dimension
    pub base_emb_dim: usize,

    /// Base number of attention heads
    pub base_num_heads: usize,

    /// Base MLP hidden dimension
    pub base_mlp_dim: usize,

    /// Base number of decoder layers
    pub base_num_decoder_layers: usize,

    /// Per-head dimension, not scaled
    pub head_dim: usize,

    /// Vocabulary size, not scaled
    pub vocab_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            global_parameter_scale: 1,
            base_emb_dim: 256,
            base_num_heads: 4,
            base_mlp_dim: 512,
            base_num_decoder_layers: 2,
            head_dim: 64,
            vocab_size: 4096,
        }
    }
}

impl ModelConfig {
    /// Embedding dimension after scaling
    pub fn emb_dim(&self) -> usize {
        self.global_parameter_scale as usize * self.base_emb_dim
    }

    /// Number of attention heads after scaling
    pub fn num_heads(&self) -> usize {
        self.global_parameter_scale as usize * self.base_num_heads
    }

    /// MLP hidden dimension after scaling
    pub fn mlp_dim(&self) -> usize {
        self.global_parameter_scale as usize * self.base_mlp_dim
    }

    /// Number of decoder layers after scaling
    pub fn num_decoder_layers(&self) -> usize {
        self.global_parameter_scale as usize * self.base_num_decoder_layers
    }
}

/// One mesh axis as written in configuration
///
/// A size of -1 marks the axis whose size is inferred from the device count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshAxisEntry {
    pub name: String,
    pub size: i64,
}

/// One logical-axis rule as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// Logical dimension name this rule matches
    pub logical: String,

    /// Mesh axes the matched dimension is split over
    pub mesh: Vec<String>,
}

/// Device mesh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    /// Number of devices participating in the run
    pub device_count: usize,

    /// Ordered mesh axes; product of sizes must equal `device_count`
    pub axes: Vec<MeshAxisEntry>,

    /// Ordered first-match-wins rules from logical dimension names to mesh
    /// axes; unmatched dimensions are replicated
    pub logical_axis_rules: Vec<RuleEntry>,
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            device_count: 1,
            axes: vec![
                MeshAxisEntry {
                    name: "data".to_string(),
                    size: -1,
                },
                MeshAxisEntry {
                    name: "model".to_string(),
                    size: 1,
                },
            ],
            logical_axis_rules: vec![
                RuleEntry {
                    logical: "batch".to_string(),
                    mesh: vec!["data".to_string()],
                },
                RuleEntry {
                    logical: "vocab".to_string(),
                    mesh: vec!["model".to_string()],
                },
                RuleEntry {
                    logical: "embed".to_string(),
                    mesh: Vec::new(),
                },
                RuleEntry {
                    logical: "mlp".to_string(),
                    mesh: vec!["model".to_string()],
                },
                RuleEntry {
                    logical: "heads".to_string(),
                    mesh: vec!["model".to_string()],
                },
            ],
        }
    }
}

/// Step counts and periodic actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Total number of steps for the run
    pub steps: u64,

    /// Emit step metrics every N executed steps, 0 disables
    pub log_period: u64,

    /// Run evaluation every N executed steps, 0 disables
    pub eval_period: u64,

    /// Batches drawn from the held-out stream per evaluation
    pub eval_batches: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            log_period: 100,
            eval_period: 0,
            eval_batches: 4,
        }
    }
}

/// Checkpoint lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Master switch; when false the run neither saves nor resumes
    pub enabled: bool,

    /// Publish a checkpoint every N completed steps, 0 disables saving
    pub save_period: u64,

    /// Keep the most recent N checkpoints, 0 keeps all
    pub max_to_keep: u64,

    /// Additionally keep every checkpoint whose step is a multiple of this
    /// period, 0 disables
    pub keep_period: u64,

    /// Capacity of the async write queue
    pub queue_depth: usize,

    /// Retry policy for checkpoint writes
    pub retry: RetryConfig,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            save_period: 1000,
            max_to_keep: 10,
            keep_period: 10000,
            queue_depth: 2,
            retry: RetryConfig::default(),
        }
    }
}

/// Batch geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Rows of the global batch assigned to each device on the batch axis
    pub per_device_batch_size: usize,

    /// Token length of each row
    pub max_target_length: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            per_device_batch_size: 4,
            max_target_length: 128,
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Peak learning rate
    pub learning_rate: f64,

    /// Linear warmup length in steps, 0 disables
    pub warmup_steps: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            warmup_steps: 0,
        }
    }
}

impl OptimizerConfig {
    /// Learning rate for a given step index under linear warmup
    pub fn learning_rate_at(&self, step: u64) -> f64 {
        if self.warmup_steps == 0 || step >= self.warmup_steps {
            self.learning_rate
        } else {
            self.learning_rate * (step + 1) as f64 / self.warmup_steps as f64
        }
    }
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Which backend to store artifacts on
    pub backend: StorageKind,

    /// Bucket name, required when `backend` is s3
    pub s3_bucket: String,

    /// Region for the s3 backend
    pub s3_region: String,

    /// Custom endpoint for s3-compatible stores, empty uses the default
    pub s3_endpoint: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageKind::Local,
            s3_bucket: String::new(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: String::new(),
        }
    }
}

/// Sampling defaults for decoding from a published checkpoint
///
/// Carried on the run configuration for offline tooling; the training
/// loop never reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Softmax temperature
    pub temperature: f64,

    /// Sample from the k most likely tokens, 0 disables the cutoff
    pub top_k: usize,

    /// Maximum tokens to generate past the prompt
    pub max_decode_length: usize,

    /// Default prompt text
    pub prompt: String,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 40,
            max_decode_length: 64,
            prompt: "I love to".to_string(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (0-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let delay = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl TrainingConfig {
    /// Load configuration from a YAML file and apply `key=value` overrides
    pub fn from_file<P: AsRef<Path>>(path: P, overrides: &[(String, String)]) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents, overrides)
    }

    /// Parse configuration from a YAML string and apply overrides
    pub fn from_yaml_str(yaml: &str, overrides: &[(String, String)]) -> Result<Self> {
        let mut doc = serde_yaml::to_value(TrainingConfig::default())?;

        if !yaml.trim().is_empty() {
            let file_doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
            if !file_doc.is_null() {
                merge_known_keys(&mut doc, file_doc, &mut Vec::new())?;
            }
        }

        for (key, value) in overrides {
            apply_override(&mut doc, key, value)?;
            info!(key = %key, value = %value, "Applying config override");
        }

        let config: TrainingConfig = serde_yaml::from_value(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Storage key prefix for this run's checkpoints, relative to the
    /// output root
    pub fn checkpoint_prefix(&self) -> String {
        format!("{}/checkpoints", self.run_name)
    }

    /// Storage key prefix for this run's metrics files
    pub fn metrics_prefix(&self) -> String {
        format!("{}/metrics", self.run_name)
    }

    /// Storage key prefix for this run, relative to the output root
    pub fn run_prefix(&self) -> String {
        self.run_name.clone()
    }

    /// Validate field values and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.run_name.is_empty() {
            return Err(Error::InvalidConfig {
                message: "run_name must be set, e.g. run_name=my_run".to_string(),
            });
        }
        if self.schedule.steps == 0 {
            return Err(Error::InvalidConfig {
                message: "schedule.steps must be at least 1".to_string(),
            });
        }
        if self.schedule.eval_period > 0 && self.schedule.eval_batches == 0 {
            return Err(Error::InvalidConfig {
                message: "schedule.eval_batches must be at least 1 when eval is enabled"
                    .to_string(),
            });
        }
        if self.model.global_parameter_scale == 0 {
            return Err(Error::InvalidConfig {
                message: "model.global_parameter_scale must be at least 1".to_string(),
            });
        }
        if self.data.per_device_batch_size == 0 || self.data.max_target_length == 0 {
            return Err(Error::InvalidConfig {
                message: "data.per_device_batch_size and data.max_target_length must be at least 1"
                    .to_string(),
            });
        }
        if self.mesh.device_count == 0 {
            return Err(Error::InvalidConfig {
                message: "mesh.device_count must be at least 1".to_string(),
            });
        }
        if self.mesh.axes.is_empty() {
            return Err(Error::InvalidConfig {
                message: "mesh.axes must name at least one axis".to_string(),
            });
        }
        let inferred = self.mesh.axes.iter().filter(|a| a.size == -1).count();
        if inferred > 1 {
            return Err(Error::InvalidConfig {
                message: "at most one mesh axis may have size -1".to_string(),
            });
        }
        if self.mesh.axes.iter().any(|a| a.size == 0 || a.size < -1) {
            return Err(Error::InvalidConfig {
                message: "mesh axis sizes must be positive or -1".to_string(),
            });
        }
        if self.checkpoint.queue_depth == 0 {
            return Err(Error::InvalidConfig {
                message: "checkpoint.queue_depth must be at least 1".to_string(),
            });
        }
        if self.storage.backend == StorageKind::S3 && self.storage.s3_bucket.is_empty() {
            return Err(Error::InvalidConfig {
                message: "storage.s3_bucket must be set when storage.backend is s3".to_string(),
            });
        }
        Ok(())
    }
}

/// Merge `overlay` into `base`, rejecting keys absent from the schema.
///
/// Mappings merge recursively; scalars and sequences replace wholesale.
fn merge_known_keys(
    base: &mut serde_yaml::Value,
    overlay: serde_yaml::Value,
    path: &mut Vec<String>,
) -> Result<()> {
    use serde_yaml::Value;

    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let segment = key.as_str().unwrap_or_default().to_string();
                match base_map.get_mut(&key) {
                    Some(slot) => {
                        path.push(segment);
                        merge_known_keys(slot, value, path)?;
                        path.pop();
                    }
                    None => {
                        path.push(segment);
                        return Err(Error::UnknownConfigKey {
                            key: path.join("."),
                        });
                    }
                }
            }
            Ok(())
        }
        (slot, value) => {
            *slot = value;
            Ok(())
        }
    }
}

/// Apply one `key=value` override onto the merged document.
///
/// The key is a dotted path; the value string is parsed according to the
/// type of the value currently at that path.
fn apply_override(doc: &mut serde_yaml::Value, key: &str, raw: &str) -> Result<()> {
    use serde_yaml::Value;

    let segments: Vec<&str> = key.split('.').collect();
    let mut cursor = doc;

    for (index, segment) in segments.iter().enumerate() {
        let map = cursor.as_mapping_mut().ok_or_else(|| Error::UnknownConfigKey {
            key: key.to_string(),
        })?;
        let slot = map
            .get_mut(Value::from(*segment))
            .ok_or_else(|| Error::UnknownConfigKey {
                key: key.to_string(),
            })?;

        if index + 1 == segments.len() {
            *slot = coerce_override(slot, raw, key)?;
            return Ok(());
        }
        cursor = slot;
    }

    Err(Error::UnknownConfigKey {
        key: key.to_string(),
    })
}

/// Parse an override string according to the type of the existing value
fn coerce_override(existing: &serde_yaml::Value, raw: &str, key: &str) -> Result<serde_yaml::Value> {
    use serde_yaml::Value;

    match existing {
        Value::Bool(_) => {
            let parsed: bool = raw.parse().map_err(|_| Error::InvalidConfig {
                message: format!("expected a bool for {key}, got {raw:?}"),
            })?;
            Ok(Value::Bool(parsed))
        }
        Value::Number(n) if n.is_f64() => {
            let parsed: f64 = raw.parse().map_err(|_| Error::InvalidConfig {
                message: format!("expected a float for {key}, got {raw:?}"),
            })?;
            Ok(Value::from(parsed))
        }
        Value::Number(_) => {
            let parsed: i64 = raw.parse().map_err(|_| Error::InvalidConfig {
                message: format!("expected an integer for {key}, got {raw:?}"),
            })?;
            Ok(Value::from(parsed))
        }
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Sequence(_) => {
            let parsed: Value = serde_yaml::from_str(raw).map_err(|_| Error::InvalidConfig {
                message: format!("expected a YAML list for {key}, got {raw:?}"),
            })?;
            if !parsed.is_sequence() {
                return Err(Error::InvalidConfig {
                    message: format!("expected a YAML list for {key}, got {raw:?}"),
                });
            }
            Ok(parsed)
        }
        _ => {
            let parsed: Value = serde_yaml::from_str(raw).map_err(|_| Error::InvalidConfig {
                message: format!("could not parse override for {key}: {raw:?}"),
            })?;
            Ok(parsed)
        }
    }
}

/// Duration serialization helper for millisecond values
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
