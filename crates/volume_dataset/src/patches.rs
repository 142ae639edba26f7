//! Patch grids over volumes and patch extraction.

use crate::types::{voxel_count, DatasetError, DatasetResult, PatchIndex, PatchSample, Shape3};
use crate::volume::Volume;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Disjoint tiling of one image by fixed-size patches.
///
/// The grid is shifted by `offset` voxels towards negative coordinates, so the
/// first patch along each axis starts at `-offset`. Tiles never overlap and
/// their valid boxes cover every image voxel exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    pub image_shape: Shape3,
    pub patch_shape: Shape3,
    pub offset: Shape3,
}

impl PatchGrid {
    pub fn new(image_shape: Shape3, patch_shape: Shape3, offset: Shape3) -> DatasetResult<Self> {
        for axis in 0..3 {
            if patch_shape[axis] == 0 || image_shape[axis] == 0 {
                return Err(DatasetError::Shape(format!(
                    "empty image {image_shape:?} or patch {patch_shape:?}"
                )));
            }
            if offset[axis] >= patch_shape[axis] {
                return Err(DatasetError::Shape(format!(
                    "offset {offset:?} must be smaller than patch {patch_shape:?}"
                )));
            }
        }
        Ok(Self {
            image_shape,
            patch_shape,
            offset,
        })
    }

    pub fn tiles_per_axis(&self) -> Shape3 {
        let mut tiles = [0; 3];
        for (axis, t) in tiles.iter_mut().enumerate() {
            *t = (self.image_shape[axis] + self.offset[axis]).div_ceil(self.patch_shape[axis]);
        }
        tiles
    }

    /// Shape of the zero-padded image the grid tiles exactly.
    pub fn padded_shape(&self) -> Shape3 {
        let tiles = self.tiles_per_axis();
        [
            tiles[0] * self.patch_shape[0],
            tiles[1] * self.patch_shape[1],
            tiles[2] * self.patch_shape[2],
        ]
    }

    fn axis_origins(&self, axis: usize) -> Vec<i64> {
        let patch = self.patch_shape[axis] as i64;
        let image = self.image_shape[axis] as i64;
        let mut origins = Vec::new();
        let mut start = -(self.offset[axis] as i64);
        while start < image {
            origins.push(start);
            start += patch;
        }
        origins
    }

    /// Patch indices for this grid, x-major.
    pub fn patches(&self, image: usize) -> Vec<PatchIndex> {
        let xs = self.axis_origins(0);
        let ys = self.axis_origins(1);
        let zs = self.axis_origins(2);
        let mut out = Vec::with_capacity(xs.len() * ys.len() * zs.len());
        for &ox in &xs {
            for &oy in &ys {
                for &oz in &zs {
                    let origin = [ox, oy, oz];
                    let mut valid_lo = [0usize; 3];
                    let mut valid_hi = [0usize; 3];
                    for axis in 0..3 {
                        let patch = self.patch_shape[axis] as i64;
                        let image_len = self.image_shape[axis] as i64;
                        valid_lo[axis] = (-origin[axis]).clamp(0, patch) as usize;
                        valid_hi[axis] = (image_len - origin[axis]).clamp(0, patch) as usize;
                    }
                    out.push(PatchIndex {
                        image,
                        origin,
                        valid_lo,
                        valid_hi,
                    });
                }
            }
        }
        out
    }
}

/// Draws patch grids for a set of images, optionally with random offsets.
#[derive(Debug, Clone)]
pub struct PatchSampler {
    pub patch_shape: Shape3,
    pub randomize_offsets: bool,
    rng: StdRng,
}

impl PatchSampler {
    pub fn new(patch_shape: Shape3, randomize_offsets: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            patch_shape,
            randomize_offsets,
            rng,
        }
    }

    fn draw_offset(&mut self) -> Shape3 {
        if !self.randomize_offsets {
            return [0; 3];
        }
        let mut offset = [0; 3];
        for (axis, o) in offset.iter_mut().enumerate() {
            *o = self.rng.random_range(0..self.patch_shape[axis]);
        }
        offset
    }

    /// Tile every image, drawing a fresh grid offset per image.
    pub fn initialize_patch_indices(
        &mut self,
        image_shapes: &[Shape3],
    ) -> DatasetResult<Vec<PatchIndex>> {
        let mut indices = Vec::new();
        for (image, shape) in image_shapes.iter().enumerate() {
            let offset = self.draw_offset();
            let grid = PatchGrid::new(*shape, self.patch_shape, offset)?;
            indices.extend(grid.patches(image));
        }
        Ok(indices)
    }
}

/// Copy the valid box of `index` out of `volume`; the rest of the patch is zero.
pub fn extract_patch(volume: &Volume, index: &PatchIndex, patch_shape: Shape3) -> PatchSample {
    let patch_voxels = voxel_count(patch_shape);
    let image_voxels = volume.voxel_count();
    let mut data = vec![0f32; volume.channels * patch_voxels];
    let mut labels = vec![0u16; patch_voxels];
    let start = index.image_start();
    let extent = index.valid_extent();

    for dx in 0..extent[0] {
        let lx = index.valid_lo[0] + dx;
        let ix = (start[0] + dx as i64) as usize;
        for dy in 0..extent[1] {
            let ly = index.valid_lo[1] + dy;
            let iy = (start[1] + dy as i64) as usize;
            let local_row = (lx * patch_shape[1] + ly) * patch_shape[2] + index.valid_lo[2];
            let image_row = volume.linear_index(ix, iy, start[2] as usize);
            let len = extent[2];
            labels[local_row..local_row + len]
                .copy_from_slice(&volume.labels[image_row..image_row + len]);
            for c in 0..volume.channels {
                let dst = c * patch_voxels + local_row;
                let src = c * image_voxels + image_row;
                data[dst..dst + len].copy_from_slice(&volume.image[src..src + len]);
            }
        }
    }

    PatchSample {
        data,
        labels,
        index: *index,
    }
}
