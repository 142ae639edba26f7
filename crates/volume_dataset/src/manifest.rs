//! Dataset manifest: which subjects exist, where their shards live, how many classes.

use crate::shard::{read_volume_shard, sha256_file, write_volume_shard};
use crate::types::{DatasetError, DatasetResult, Shape3};
use crate::volume::Volume;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectEntry {
    pub id: String,
    /// Shard path relative to the dataset root (UTF-8).
    pub relative_path: String,
    pub shape: Shape3,
    pub channels: usize,
    /// Hex-encoded SHA256 of the shard file.
    pub checksum_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub name: String,
    pub num_classes: usize,
    pub created_at_ms: u64,
    pub subjects: Vec<SubjectEntry>,
}

impl VolumeManifest {
    pub fn new(name: impl Into<String>, num_classes: usize) -> Self {
        let created_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            name: name.into(),
            num_classes,
            created_at_ms,
            subjects: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| DatasetError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| DatasetError::Other(e.to_string()))?;
        fs::write(path, data).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read(path).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| DatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn entry(&self, id: &str) -> DatasetResult<&SubjectEntry> {
        self.subjects
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| DatasetError::UnknownSubject(id.to_string()))
    }

    pub fn resolve(&self, root: &Path, id: &str) -> DatasetResult<PathBuf> {
        Ok(root.join(&self.entry(id)?.relative_path))
    }

    /// Load the listed subjects in filter order.
    ///
    /// Every shard's shape must agree with its manifest entry and every label
    /// must be below `num_classes`. With `verify`, shard checksums are recomputed.
    pub fn load_subjects(
        &self,
        root: &Path,
        filter: &[String],
        verify: bool,
    ) -> DatasetResult<Vec<Volume>> {
        filter
            .iter()
            .map(|id| {
                let entry = self.entry(id)?;
                let path = root.join(&entry.relative_path);
                if verify {
                    if let Some(expected) = &entry.checksum_sha256 {
                        let actual = sha256_file(&path)?;
                        if &actual != expected {
                            return Err(DatasetError::ChecksumMismatch {
                                path,
                                expected: expected.clone(),
                                actual,
                            });
                        }
                    }
                }
                let t0 = Instant::now();
                let volume = read_volume_shard(&path, id)?;
                if volume.shape != entry.shape || volume.channels != entry.channels {
                    return Err(DatasetError::BadShard {
                        path,
                        msg: format!(
                            "shard is {:?}x{} but manifest says {:?}x{}",
                            volume.shape, volume.channels, entry.shape, entry.channels
                        ),
                    });
                }
                volume.validate_labels(self.num_classes)?;
                tracing::debug!(
                    subject = %id,
                    shape = ?volume.shape,
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "loaded volume shard"
                );
                Ok(volume)
            })
            .collect()
    }
}

/// Writes shards into a dataset directory and accumulates the manifest.
pub struct VolumeManifestBuilder {
    root: PathBuf,
    manifest: VolumeManifest,
}

impl VolumeManifestBuilder {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>, num_classes: usize) -> Self {
        Self {
            root: root.into(),
            manifest: VolumeManifest::new(name, num_classes),
        }
    }

    pub fn add_volume(&mut self, volume: &Volume) -> DatasetResult<&SubjectEntry> {
        if self.manifest.subjects.iter().any(|s| s.id == volume.subject) {
            return Err(DatasetError::Other(format!(
                "subject {} added twice",
                volume.subject
            )));
        }
        volume.validate_labels(self.manifest.num_classes)?;
        let relative_path = format!("volumes/{}.mrv", volume.subject);
        let checksum = write_volume_shard(&self.root.join(&relative_path), volume)?;
        self.manifest.subjects.push(SubjectEntry {
            id: volume.subject.clone(),
            relative_path,
            shape: volume.shape,
            channels: volume.channels,
            checksum_sha256: Some(checksum),
        });
        let idx = self.manifest.subjects.len() - 1;
        Ok(&self.manifest.subjects[idx])
    }

    /// Write `manifest.json` under the root and return the manifest.
    pub fn finish(self) -> DatasetResult<VolumeManifest> {
        self.manifest.save(&self.root.join(DEFAULT_MANIFEST_NAME))?;
        Ok(self.manifest)
    }
}
