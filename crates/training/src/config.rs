//! Optional TOML configuration for the segmentation driver.
//!
//! Lookup order: explicit `--config` path, then `$SEGMENT_CONFIG`, then
//! `segmentation.toml` in the working directory. Missing keys fall back to
//! the defaults below; CLI flags override whatever the file says.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use volume_dataset::{SubjectSplits, DEFAULT_MANIFEST_NAME};

pub const DEFAULT_CONFIG_NAME: &str = "segmentation.toml";
pub const CONFIG_ENV: &str = "SEGMENT_CONFIG";

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentConfig {
    pub dataset_root: PathBuf,
    /// Manifest file name, relative to `dataset_root`.
    pub manifest: String,
    pub splits: SubjectSplits,
    pub checkpoint_path: PathBuf,
    pub metrics_path: PathBuf,
    pub log_path: Option<PathBuf>,
    /// Where validate/test runs write predicted label shards, if anywhere.
    pub predictions_root: Option<PathBuf>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        let logs_root = PathBuf::from("logs");
        Self {
            dataset_root: PathBuf::from("data/miccai2012"),
            manifest: DEFAULT_MANIFEST_NAME.to_string(),
            splits: SubjectSplits::default(),
            checkpoint_path: PathBuf::from("checkpoints/segmentation.bin"),
            metrics_path: logs_root.join("metrics.jsonl"),
            log_path: None,
            predictions_root: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SegmentConfigFile {
    dataset_root: Option<String>,
    manifest: Option<String>,
    checkpoint_path: Option<String>,
    metrics_path: Option<String>,
    log_path: Option<String>,
    predictions_root: Option<String>,
    splits: Option<SplitsSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SplitsSection {
    train: Option<Vec<String>>,
    validation: Option<Vec<String>>,
    test: Option<Vec<String>>,
}

impl SegmentConfig {
    /// Resolve the configuration; an explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Self::from_path(Path::new(&path));
            }
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.exists() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg = Self::from_toml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let file: SegmentConfigFile = toml::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: SegmentConfigFile) -> Self {
        let defaults = Self::default();
        let splits = file.splits.unwrap_or_default();
        SegmentConfig {
            dataset_root: file
                .dataset_root
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.dataset_root),
            manifest: file.manifest.unwrap_or(defaults.manifest),
            splits: SubjectSplits {
                train: splits.train.unwrap_or(defaults.splits.train),
                validation: splits.validation.unwrap_or(defaults.splits.validation),
                test: splits.test.unwrap_or(defaults.splits.test),
            },
            checkpoint_path: file
                .checkpoint_path
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.checkpoint_path),
            metrics_path: file
                .metrics_path
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.metrics_path),
            log_path: file.log_path.map(|v| expand_path(&v)),
            predictions_root: file.predictions_root.map(|v| expand_path(&v)),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dataset_root.join(&self.manifest)
    }
}

/// `~` prefix → `$HOME`, `${VAR}` → its value (left untouched when unset).
fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = SegmentConfig::from_toml("").unwrap();
        assert_eq!(cfg, SegmentConfig::default());
        assert_eq!(
            cfg.manifest_path(),
            PathBuf::from("data/miccai2012").join(DEFAULT_MANIFEST_NAME)
        );
    }

    #[test]
    fn file_overrides_paths_and_partial_splits() {
        let cfg = SegmentConfig::from_toml(
            r#"
            dataset_root = "/data/mri"
            metrics_path = "/tmp/m.jsonl"
            log_path = "/tmp/train.log"

            [splits]
            train = ["a", "b"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dataset_root, PathBuf::from("/data/mri"));
        assert_eq!(cfg.log_path, Some(PathBuf::from("/tmp/train.log")));
        assert_eq!(cfg.splits.train, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.splits.test, SubjectSplits::default().test);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SegmentConfig::from_toml("dataset_rot = \"x\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(SegmentConfig::load(Some(&tmp.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn env_placeholders_without_value_are_kept() {
        assert_eq!(
            expand_env("root/${SEGMENT_TEST_SURELY_UNSET}/x"),
            "root/${SEGMENT_TEST_SURELY_UNSET}/x"
        );
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }
}
