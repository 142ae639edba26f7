//! Patch-level view over a set of subject volumes.

use crate::manifest::VolumeManifest;
use crate::patches::{extract_patch, PatchSampler};
use crate::types::{DatasetError, DatasetResult, PatchIndex, PatchSample, Shape3};
use crate::volume::Volume;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct MriDatasetConfig {
    pub patch_shape: Shape3,
    /// Shift each image's patch grid by a random offset (training).
    pub randomize_patch_offsets: bool,
    pub seed: Option<u64>,
    /// Recompute shard checksums while loading.
    pub verify_checksums: bool,
}

impl MriDatasetConfig {
    pub fn cubic(patch_size: usize) -> Self {
        Self {
            patch_shape: [patch_size; 3],
            randomize_patch_offsets: true,
            seed: None,
            verify_checksums: false,
        }
    }
}

/// Volumes of one split, tiled into patches.
#[derive(Debug)]
pub struct MriSegmentation {
    volumes: Vec<Volume>,
    num_classes: usize,
    patch_shape: Shape3,
    sampler: PatchSampler,
    patches: Vec<PatchIndex>,
}

impl MriSegmentation {
    pub fn from_volumes(
        volumes: Vec<Volume>,
        num_classes: usize,
        cfg: &MriDatasetConfig,
    ) -> DatasetResult<Self> {
        if volumes.is_empty() {
            return Err(DatasetError::Other("dataset has no volumes".into()));
        }
        let channels = volumes[0].channels;
        for vol in &volumes {
            if vol.channels != channels {
                return Err(DatasetError::Shape(format!(
                    "subject {} has {} channels, expected {channels}",
                    vol.subject, vol.channels
                )));
            }
            vol.validate_labels(num_classes)?;
        }
        let mut dataset = Self {
            volumes,
            num_classes,
            patch_shape: cfg.patch_shape,
            sampler: PatchSampler::new(cfg.patch_shape, cfg.randomize_patch_offsets, cfg.seed),
            patches: Vec::new(),
        };
        dataset.initialize_patch_indices()?;
        Ok(dataset)
    }

    /// Load `filter` subjects from the manifest at `manifest_path`.
    pub fn open(
        manifest_path: &Path,
        filter: &[String],
        cfg: &MriDatasetConfig,
    ) -> DatasetResult<Self> {
        let manifest = VolumeManifest::load(manifest_path)?;
        let root = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let volumes = manifest.load_subjects(root, filter, cfg.verify_checksums)?;
        tracing::info!(
            manifest = %manifest_path.display(),
            subjects = volumes.len(),
            num_classes = manifest.num_classes,
            "opened MRI segmentation dataset"
        );
        Self::from_volumes(volumes, manifest.num_classes, cfg)
    }

    /// Redraw the patch grids (new random offsets when enabled).
    pub fn initialize_patch_indices(&mut self) -> DatasetResult<()> {
        let shapes = self.unpadded_shapes();
        self.patches = self.sampler.initialize_patch_indices(&shapes)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<PatchSample> {
        let index = self.patches.get(i)?;
        let volume = self.volumes.get(index.image)?;
        Some(extract_patch(volume, index, self.patch_shape))
    }

    pub fn patch_index(&self, i: usize) -> Option<&PatchIndex> {
        self.patches.get(i)
    }

    pub fn patch_shape(&self) -> Shape3 {
        self.patch_shape
    }

    pub fn channels(&self) -> usize {
        self.volumes[0].channels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_volumes(&self) -> usize {
        self.volumes.len()
    }

    pub fn unpadded_shapes(&self) -> Vec<Shape3> {
        self.volumes.iter().map(|v| v.shape).collect()
    }

    /// Original (unpatched) volume `i`.
    pub fn get_original(&self, i: usize) -> Option<&Volume> {
        self.volumes.get(i)
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// Voxel count per class summed over all volumes.
    pub fn class_count(&self) -> Vec<u64> {
        let mut total = vec![0u64; self.num_classes];
        for vol in &self.volumes {
            for (t, c) in total.iter_mut().zip(vol.class_count(self.num_classes)) {
                *t += c;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes() -> Vec<Volume> {
        vec![
            Volume::new("a", [4, 4, 4], 1, vec![0.5; 64], vec![1; 64]).unwrap(),
            Volume::new("b", [5, 3, 2], 1, vec![0.5; 30], vec![2; 30]).unwrap(),
        ]
    }

    #[test]
    fn counts_patches_and_classes() {
        let cfg = MriDatasetConfig {
            patch_shape: [2, 2, 2],
            randomize_patch_offsets: false,
            seed: Some(0),
            verify_checksums: false,
        };
        let ds = MriSegmentation::from_volumes(volumes(), 3, &cfg).unwrap();
        assert_eq!(ds.len(), 8 + 3 * 2 * 1);
        assert_eq!(ds.class_count(), vec![0, 64, 30]);
        assert_eq!(ds.unpadded_shapes(), vec![[4, 4, 4], [5, 3, 2]]);
        let last = ds.get(ds.len() - 1).unwrap();
        assert_eq!(last.index.image, 1);
    }

    #[test]
    fn reinitializing_keeps_full_coverage() {
        let cfg = MriDatasetConfig {
            patch_shape: [3, 3, 3],
            randomize_patch_offsets: true,
            seed: Some(11),
            verify_checksums: false,
        };
        let mut ds = MriSegmentation::from_volumes(volumes(), 3, &cfg).unwrap();
        for _ in 0..3 {
            ds.initialize_patch_indices().unwrap();
            let covered: usize = (0..ds.len())
                .map(|i| ds.patch_index(i).unwrap().valid_voxels())
                .sum();
            assert_eq!(covered, 64 + 30);
        }
    }

    #[test]
    fn mixed_channel_counts_are_rejected() {
        let mut vols = volumes();
        vols.push(Volume::new("c", [2, 2, 2], 2, vec![0.0; 16], vec![0; 8]).unwrap());
        let cfg = MriDatasetConfig::cubic(2);
        assert!(MriSegmentation::from_volumes(vols, 3, &cfg).is_err());
    }
}
