//! Synthetic phantom volumes for smoke tests and pipeline dry runs.

use crate::manifest::{VolumeManifest, VolumeManifestBuilder};
use crate::types::{voxel_count, DatasetError, DatasetResult, Shape3};
use crate::volume::Volume;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PhantomConfig {
    pub shape: Shape3,
    pub num_classes: usize,
    /// Uniform noise amplitude added to intensities.
    pub noise: f32,
    pub seed: u64,
}

impl Default for PhantomConfig {
    fn default() -> Self {
        Self {
            shape: [32, 32, 32],
            num_classes: 4,
            noise: 0.05,
            seed: 0,
        }
    }
}

/// Nested ellipsoid shells around a jittered center; shell `k` carries label `k`.
pub fn phantom_volume(subject: &str, cfg: &PhantomConfig) -> DatasetResult<Volume> {
    if cfg.num_classes < 2 {
        return Err(DatasetError::Other(format!(
            "phantom needs at least 2 classes, got {}",
            cfg.num_classes
        )));
    }
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let [sx, sy, sz] = cfg.shape;
    let center = [
        sx as f32 / 2.0 + rng.random_range(-1.0..=1.0),
        sy as f32 / 2.0 + rng.random_range(-1.0..=1.0),
        sz as f32 / 2.0 + rng.random_range(-1.0..=1.0),
    ];
    let radii = [sx as f32 * 0.45, sy as f32 * 0.45, sz as f32 * 0.45];
    let shells = cfg.num_classes.saturating_sub(1).max(1);

    let n = voxel_count(cfg.shape);
    let mut image = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);
    for x in 0..sx {
        for y in 0..sy {
            for z in 0..sz {
                let d = [
                    (x as f32 - center[0]) / radii[0],
                    (y as f32 - center[1]) / radii[1],
                    (z as f32 - center[2]) / radii[2],
                ];
                let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                let label = if r >= 1.0 {
                    0
                } else {
                    (((1.0 - r) * shells as f32).floor() as usize + 1).min(cfg.num_classes - 1)
                };
                labels.push(label as u16);
                let noise = if cfg.noise > 0.0 {
                    rng.random_range(-cfg.noise..=cfg.noise)
                } else {
                    0.0
                };
                image.push(label as f32 / cfg.num_classes as f32 + noise);
            }
        }
    }
    Volume::new(subject, cfg.shape, 1, image, labels)
}

/// Write one phantom per subject id into `root` and return the manifest.
pub fn write_phantom_dataset(
    root: &Path,
    subjects: &[String],
    cfg: &PhantomConfig,
) -> DatasetResult<VolumeManifest> {
    let mut builder = VolumeManifestBuilder::new(root, "phantom", cfg.num_classes);
    for (i, subject) in subjects.iter().enumerate() {
        let vol_cfg = PhantomConfig {
            seed: cfg.seed.wrapping_add(i as u64),
            ..cfg.clone()
        };
        builder.add_volume(&phantom_volume(subject, &vol_cfg)?)?;
    }
    builder.finish()
}
