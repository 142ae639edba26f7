//! Core types and error definitions for volume_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Spatial extent of a volume or patch along (x, y, z).
pub type Shape3 = [usize; 3];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed volume shard {path}: {msg}")]
    BadShard { path: PathBuf, msg: String },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("subject {0} is not listed in the manifest")]
    UnknownSubject(String),
    #[error("{a} and {b} splits overlap: {subjects:?}")]
    OverlappingSplits {
        a: &'static str,
        b: &'static str,
        subjects: Vec<String>,
    },
    #[error("subject {subject} has label {label} but the dataset declares {num_classes} classes")]
    LabelOutOfRange {
        subject: String,
        label: u16,
        num_classes: usize,
    },
    #[error("shape error: {0}")]
    Shape(String),
    #[error("{0}")]
    Other(String),
}

/// Location of one patch inside its source volume.
///
/// `origin` is the image coordinate of the patch's local voxel (0, 0, 0). It is
/// negative when the patch grid was shifted by a random offset, so part of the
/// patch hangs over the image border. `valid_lo..valid_hi` is the patch-local box
/// that actually overlaps the image; everything outside it is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchIndex {
    pub image: usize,
    pub origin: [i64; 3],
    pub valid_lo: Shape3,
    pub valid_hi: Shape3,
}

impl PatchIndex {
    pub fn valid_extent(&self) -> Shape3 {
        [
            self.valid_hi[0].saturating_sub(self.valid_lo[0]),
            self.valid_hi[1].saturating_sub(self.valid_lo[1]),
            self.valid_hi[2].saturating_sub(self.valid_lo[2]),
        ]
    }

    /// True when the patch does not overlap its image at all.
    pub fn is_empty(&self) -> bool {
        self.valid_extent().iter().any(|&e| e == 0)
    }

    /// Image coordinate of the first valid voxel.
    pub fn image_start(&self) -> [i64; 3] {
        [
            self.origin[0] + self.valid_lo[0] as i64,
            self.origin[1] + self.valid_lo[1] as i64,
            self.origin[2] + self.valid_lo[2] as i64,
        ]
    }

    pub fn valid_voxels(&self) -> usize {
        self.valid_extent().iter().product()
    }

    /// Whether patch-local voxel `(x, y, z)` lies inside the valid box.
    pub fn contains_local(&self, x: usize, y: usize, z: usize) -> bool {
        x >= self.valid_lo[0]
            && x < self.valid_hi[0]
            && y >= self.valid_lo[1]
            && y < self.valid_hi[1]
            && z >= self.valid_lo[2]
            && z < self.valid_hi[2]
    }
}

/// A single extracted training/inference patch.
#[derive(Debug, Clone)]
pub struct PatchSample {
    /// Intensities in C, X, Y, Z order, zero outside the valid box.
    pub data: Vec<f32>,
    /// Class labels in X, Y, Z order, background (0) outside the valid box.
    pub labels: Vec<u16>,
    pub index: PatchIndex,
}

pub fn voxel_count(shape: Shape3) -> usize {
    shape[0] * shape[1] * shape[2]
}
