//! Metrics sinks

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use runtime_core::{Result, StepMetrics};
use tracing::info;

/// File name of the per-run metrics log
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Receives per-step scalar metrics
///
/// Sinks are best-effort collaborators: the training loop logs a sink
/// failure and keeps going.
pub trait MetricsSink: Send {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()>;

    /// Name used in log lines when the sink fails
    fn name(&self) -> &str;
}

/// Emits metrics as structured log events
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        info!(
            step = metrics.step,
            loss = metrics.loss,
            learning_rate = metrics.learning_rate,
            step_time_ms = metrics.step_time_ms,
            tokens_per_second = metrics.tokens_per_second,
            "Step metrics"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Appends one JSON object per recorded step to the run's metrics file
///
/// The file is opened in append mode so a resumed session continues the
/// same history.
pub struct JsonlSink {
    file: File,
}

impl JsonlSink {
    pub fn create(metrics_dir: &Path) -> Result<Self> {
        fs::create_dir_all(metrics_dir)?;
        let path = metrics_dir.join(METRICS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        let line = serde_json::to_string(metrics)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(step: u64) -> StepMetrics {
        StepMetrics {
            step,
            loss: 3.25,
            learning_rate: 1e-3,
            step_time_ms: 12.0,
            tokens_per_second: Some(1024.0),
        }
    }

    #[test]
    fn test_jsonl_sink_writes_parseable_lines() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::create(dir.path()).unwrap();
        sink.record(&sample(0)).unwrap();
        sink.record(&sample(1)).unwrap();

        let contents = fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        let steps: Vec<u64> = contents
            .lines()
            .map(|line| serde_json::from_str::<StepMetrics>(line).unwrap().step)
            .collect();
        assert_eq!(steps, vec![0, 1]);
    }

    #[test]
    fn test_jsonl_sink_appends_across_sessions() {
        let dir = TempDir::new().unwrap();
        {
            let mut sink = JsonlSink::create(dir.path()).unwrap();
            sink.record(&sample(0)).unwrap();
        }
        {
            let mut sink = JsonlSink::create(dir.path()).unwrap();
            sink.record(&sample(1)).unwrap();
        }

        let contents = fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_tracing_sink_never_fails() {
        let mut sink = TracingSink;
        assert!(sink.record(&sample(5)).is_ok());
        assert_eq!(sink.name(), "tracing");
    }
}
