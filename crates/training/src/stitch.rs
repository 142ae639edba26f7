//! Reassembly of per-patch predictions into full label volumes.

use thiserror::Error;
use volume_dataset::{voxel_count, PatchIndex, Shape3};

const UNSET: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StitchError {
    #[error("patch refers to image {image} but only {count} images are being assembled")]
    ImageOutOfRange { image: usize, count: usize },
    #[error("prediction has {actual} voxels, patch shape {patch:?} needs {expected}")]
    PredictionSize {
        patch: Shape3,
        expected: usize,
        actual: usize,
    },
    #[error("valid box {lo:?}..{hi:?} does not fit patch shape {patch:?}")]
    BadValidBox {
        lo: Shape3,
        hi: Shape3,
        patch: Shape3,
    },
    #[error("patch region starting at {start:?} with extent {extent:?} leaves image {image} of shape {shape:?}")]
    OutOfBounds {
        image: usize,
        start: [i64; 3],
        extent: Shape3,
        shape: Shape3,
    },
    #[error("predicted label {label} at image {image} does not fit a class id")]
    BadLabel { image: usize, label: i64 },
    #[error("image {image} has {missing} voxels not covered by any patch")]
    Incomplete { image: usize, missing: usize },
}

/// Collects patch predictions into one label buffer per image.
///
/// Buffers start out unset; [`VolumeAssembler::finish`] refuses to hand out
/// a volume with any voxel that no patch wrote.
#[derive(Debug)]
pub struct VolumeAssembler {
    shapes: Vec<Shape3>,
    images: Vec<Vec<i32>>,
}

impl VolumeAssembler {
    pub fn new(shapes: &[Shape3]) -> Self {
        Self {
            shapes: shapes.to_vec(),
            images: shapes
                .iter()
                .map(|s| vec![UNSET; voxel_count(*s)])
                .collect(),
        }
    }

    /// Copy the valid box of `prediction` (patch-local, X-major) into its image.
    ///
    /// Patches without any overlap with their image are ignored.
    pub fn insert(
        &mut self,
        index: &PatchIndex,
        patch_shape: Shape3,
        prediction: &[i64],
    ) -> Result<(), StitchError> {
        let count = self.images.len();
        let shape = *self
            .shapes
            .get(index.image)
            .ok_or(StitchError::ImageOutOfRange {
                image: index.image,
                count,
            })?;
        let expected = voxel_count(patch_shape);
        if prediction.len() != expected {
            return Err(StitchError::PredictionSize {
                patch: patch_shape,
                expected,
                actual: prediction.len(),
            });
        }
        if (0..3).any(|a| index.valid_lo[a] > index.valid_hi[a] || index.valid_hi[a] > patch_shape[a]) {
            return Err(StitchError::BadValidBox {
                lo: index.valid_lo,
                hi: index.valid_hi,
                patch: patch_shape,
            });
        }
        if index.is_empty() {
            return Ok(());
        }

        let start = index.image_start();
        let extent = index.valid_extent();
        if (0..3).any(|a| start[a] < 0 || start[a] as usize + extent[a] > shape[a]) {
            return Err(StitchError::OutOfBounds {
                image: index.image,
                start,
                extent,
                shape,
            });
        }

        let image = &mut self.images[index.image];
        for dx in 0..extent[0] {
            let gx = start[0] as usize + dx;
            let lx = index.valid_lo[0] + dx;
            for dy in 0..extent[1] {
                let gy = start[1] as usize + dy;
                let ly = index.valid_lo[1] + dy;
                let dst = (gx * shape[1] + gy) * shape[2] + start[2] as usize;
                let src = (lx * patch_shape[1] + ly) * patch_shape[2] + index.valid_lo[2];
                for dz in 0..extent[2] {
                    let label = prediction[src + dz];
                    if !(0..=u16::MAX as i64).contains(&label) {
                        return Err(StitchError::BadLabel {
                            image: index.image,
                            label,
                        });
                    }
                    image[dst + dz] = label as i32;
                }
            }
        }
        Ok(())
    }

    /// Number of voxels still unset in image `i`.
    pub fn missing(&self, i: usize) -> usize {
        self.images
            .get(i)
            .map(|img| img.iter().filter(|&&v| v == UNSET).count())
            .unwrap_or(0)
    }

    pub fn finish(self) -> Result<Vec<Vec<u16>>, StitchError> {
        for i in 0..self.images.len() {
            let missing = self.missing(i);
            if missing > 0 {
                return Err(StitchError::Incomplete { image: i, missing });
            }
        }
        Ok(self
            .images
            .into_iter()
            .map(|img| img.into_iter().map(|v| v as u16).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volume_dataset::PatchGrid;

    /// Predicts, for every local voxel, the global linear index modulo 1000.
    fn oracle(index: &PatchIndex, patch: Shape3, shape: Shape3) -> Vec<i64> {
        let mut out = vec![999; voxel_count(patch)];
        for x in 0..patch[0] {
            for y in 0..patch[1] {
                for z in 0..patch[2] {
                    let g = [
                        index.origin[0] + x as i64,
                        index.origin[1] + y as i64,
                        index.origin[2] + z as i64,
                    ];
                    if (0..3).all(|a| g[a] >= 0 && (g[a] as usize) < shape[a]) {
                        let lin = (g[0] as usize * shape[1] + g[1] as usize) * shape[2] + g[2] as usize;
                        out[(x * patch[1] + y) * patch[2] + z] = (lin % 1000) as i64;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn shifted_grid_reassembles_exactly() {
        let shape = [7, 6, 5];
        let patch = [3, 4, 2];
        for offset in [[0, 0, 0], [2, 1, 1], [1, 3, 0]] {
            let grid = PatchGrid::new(shape, patch, offset).unwrap();
            let mut asm = VolumeAssembler::new(&[shape]);
            for idx in grid.patches(0) {
                asm.insert(&idx, patch, &oracle(&idx, patch, shape)).unwrap();
            }
            let out = asm.finish().unwrap();
            let expected: Vec<u16> = (0..voxel_count(shape)).map(|v| (v % 1000) as u16).collect();
            assert_eq!(out[0], expected, "offset {offset:?}");
        }
    }

    #[test]
    fn missing_patch_is_reported() {
        let shape = [4, 4, 4];
        let patch = [2, 2, 2];
        let grid = PatchGrid::new(shape, patch, [0, 0, 0]).unwrap();
        let mut asm = VolumeAssembler::new(&[shape, [2, 2, 2]]);
        for idx in grid.patches(0).into_iter().skip(1) {
            asm.insert(&idx, patch, &vec![1; 8]).unwrap();
        }
        asm.insert(
            &PatchIndex {
                image: 1,
                origin: [0, 0, 0],
                valid_lo: [0, 0, 0],
                valid_hi: [2, 2, 2],
            },
            patch,
            &[2; 8],
        )
        .unwrap();
        assert_eq!(
            asm.finish().unwrap_err(),
            StitchError::Incomplete { image: 0, missing: 8 }
        );
    }

    #[test]
    fn empty_patch_is_skipped() {
        let mut asm = VolumeAssembler::new(&[[2, 2, 2]]);
        let idx = PatchIndex {
            image: 0,
            origin: [2, 0, 0],
            valid_lo: [0, 0, 0],
            valid_hi: [0, 2, 2],
        };
        asm.insert(&idx, [2, 2, 2], &[5; 8]).unwrap();
        assert_eq!(asm.missing(0), 8);
    }

    #[test]
    fn geometry_errors_are_caught() {
        let mut asm = VolumeAssembler::new(&[[2, 2, 2]]);
        let idx = PatchIndex {
            image: 0,
            origin: [1, 0, 0],
            valid_lo: [0, 0, 0],
            valid_hi: [2, 2, 2],
        };
        assert!(matches!(
            asm.insert(&idx, [2, 2, 2], &[0; 8]),
            Err(StitchError::OutOfBounds { .. })
        ));
        assert!(matches!(
            asm.insert(&PatchIndex { image: 3, ..idx }, [2, 2, 2], &[0; 8]),
            Err(StitchError::ImageOutOfRange { image: 3, count: 1 })
        ));
        assert!(matches!(
            asm.insert(&idx, [2, 2, 2], &[0; 7]),
            Err(StitchError::PredictionSize { .. })
        ));
        let bad_box = PatchIndex {
            valid_hi: [3, 2, 2],
            origin: [0, 0, 0],
            ..idx
        };
        assert!(matches!(
            asm.insert(&bad_box, [2, 2, 2], &[0; 8]),
            Err(StitchError::BadValidBox { .. })
        ));
        let inside = PatchIndex {
            origin: [0, 0, 0],
            ..idx
        };
        let mut negative = [0; 8];
        negative[5] = -1;
        assert!(matches!(
            asm.insert(&inside, [2, 2, 2], &negative),
            Err(StitchError::BadLabel { image: 0, label: -1 })
        ));
        let mut wide = [1; 8];
        wide[0] = 70_000;
        assert!(matches!(
            asm.insert(&inside, [2, 2, 2], &wide),
            Err(StitchError::BadLabel { image: 0, label: 70_000 })
        ));
    }
}
