//! Tracing setup and the per-epoch JSONL metrics log.

use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: `RUST_LOG` filter (default `info`), stderr
/// output, and an optional plain-text mirror appended to `log_file`.
pub fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let file_layer = match log_file {
        Some(path) => {
            create_parent(path)?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialised: {e}"))
}

/// One line of the metrics log.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub mode: &'static str,
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: Option<f64>,
    pub train_dice: Option<f64>,
    pub loss: f64,
    pub dice: f64,
    pub seconds: f64,
}

/// Appends JSON records, one per line.
#[derive(Debug, Clone)]
pub struct MetricsWriter {
    path: PathBuf,
}

impl MetricsWriter {
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        create_parent(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> anyhow::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open metrics log {}", self.path.display()))?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

fn create_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_appended_as_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = MetricsWriter::create(tmp.path().join("logs/metrics.jsonl")).unwrap();
        for epoch in 0..2 {
            writer
                .append(&EpochMetrics {
                    mode: "train",
                    epoch,
                    lr: 1e-2,
                    train_loss: Some(0.5),
                    train_dice: None,
                    loss: f64::NAN,
                    dice: 0.25,
                    seconds: 1.0,
                })
                .unwrap();
        }
        let raw = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert!(lines[0]["loss"].is_null());
        assert!(lines[0]["train_dice"].is_null());
    }
}
