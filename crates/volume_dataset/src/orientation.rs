//! Random orientation augmentation for training patches.

use crate::types::{voxel_count, PatchSample, Shape3};
use rand::seq::SliceRandom;
use rand::Rng;

/// Axis permutation followed by per-axis flips.
///
/// Output axis `a` reads input axis `permutation[a]`, mirrored when `flips[a]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation {
    pub permutation: [usize; 3],
    pub flips: [bool; 3],
}

impl Orientation {
    pub fn identity() -> Self {
        Self {
            permutation: [0, 1, 2],
            flips: [false; 3],
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Random flips; axes are only permuted for cubic patches so the patch shape is kept.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, patch_shape: Shape3) -> Self {
        let mut permutation = [0, 1, 2];
        if patch_shape[0] == patch_shape[1] && patch_shape[1] == patch_shape[2] {
            permutation.shuffle(rng);
        }
        Self {
            permutation,
            flips: [rng.random(), rng.random(), rng.random()],
        }
    }

    fn output_shape(&self, shape: Shape3) -> Shape3 {
        [
            shape[self.permutation[0]],
            shape[self.permutation[1]],
            shape[self.permutation[2]],
        ]
    }

    /// Reorient the voxels and the valid box of `sample` in place.
    ///
    /// `origin` loses its meaning afterwards; reoriented samples are only used
    /// where the valid box matters (loss masking), never for reassembly.
    pub fn apply(&self, sample: &mut PatchSample, patch_shape: Shape3) {
        if self.is_identity() {
            return;
        }
        let out_shape = self.output_shape(patch_shape);
        let voxels = voxel_count(patch_shape);
        let channels = sample.data.len() / voxels.max(1);

        let mut data = vec![0f32; sample.data.len()];
        let mut labels = vec![0u16; voxels];
        let mut src = [0usize; 3];
        for ox in 0..out_shape[0] {
            for oy in 0..out_shape[1] {
                for oz in 0..out_shape[2] {
                    let out = [ox, oy, oz];
                    for axis in 0..3 {
                        let input_axis = self.permutation[axis];
                        src[input_axis] = if self.flips[axis] {
                            out_shape[axis] - 1 - out[axis]
                        } else {
                            out[axis]
                        };
                    }
                    let dst_i = (ox * out_shape[1] + oy) * out_shape[2] + oz;
                    let src_i = (src[0] * patch_shape[1] + src[1]) * patch_shape[2] + src[2];
                    labels[dst_i] = sample.labels[src_i];
                    for c in 0..channels {
                        data[c * voxels + dst_i] = sample.data[c * voxels + src_i];
                    }
                }
            }
        }

        let idx = &mut sample.index;
        let (old_lo, old_hi) = (idx.valid_lo, idx.valid_hi);
        for axis in 0..3 {
            let input_axis = self.permutation[axis];
            if self.flips[axis] {
                idx.valid_lo[axis] = out_shape[axis] - old_hi[input_axis];
                idx.valid_hi[axis] = out_shape[axis] - old_lo[input_axis];
            } else {
                idx.valid_lo[axis] = old_lo[input_axis];
                idx.valid_hi[axis] = old_hi[input_axis];
            }
        }
        sample.data = data;
        sample.labels = labels;
    }
}
