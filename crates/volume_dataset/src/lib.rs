//! MRI volume storage, patch sampling and Burn batching for segmentation training.
//!
//! This crate provides:
//! - `MRV1` volume shards and a JSON manifest describing a dataset directory
//! - subject-level train/validation/test splits
//! - disjoint patch grids with optional random offsets, patch extraction
//! - random orientation augmentation
//! - synthetic phantom datasets
//! - Burn-compatible batch iteration

pub mod batch;
pub mod dataset;
pub mod manifest;
pub mod orientation;
pub mod patches;
pub mod shard;
pub mod splits;
pub mod synthetic;
pub mod types;
pub mod volume;

pub use batch::{PatchBatch, PatchBatchIter, PatchLoaderConfig};
pub use dataset::{MriDatasetConfig, MriSegmentation};
pub use manifest::{SubjectEntry, VolumeManifest, VolumeManifestBuilder, DEFAULT_MANIFEST_NAME};
pub use orientation::Orientation;
pub use patches::{extract_patch, PatchGrid, PatchSampler};
pub use shard::{read_volume_shard, sha256_file, write_volume_shard};
pub use splits::SubjectSplits;
pub use synthetic::{phantom_volume, write_phantom_dataset, PhantomConfig};
pub use types::*;
pub use volume::Volume;
