//! Batch iteration over patch datasets.

use crate::dataset::MriSegmentation;
use crate::orientation::Orientation;
use crate::types::{voxel_count, DatasetError, DatasetResult, PatchIndex, PatchSample};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct PatchLoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Drop the last partial batch.
    pub drop_last: bool,
    pub seed: Option<u64>,
    /// Apply a random orientation to every patch (training only).
    pub randomize_orientation: bool,
}

impl PatchLoaderConfig {
    pub fn training(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
            seed: None,
            randomize_orientation: false,
        }
    }

    pub fn inference(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: None,
            randomize_orientation: false,
        }
    }
}

pub struct PatchBatch<B: Backend> {
    /// `[N, C, X, Y, Z]` intensities.
    pub data: Tensor<B, 5>,
    /// `[N, X, Y, Z]` class labels.
    pub target: Tensor<B, 4, Int>,
    /// Host copy of `target`, sample-major.
    pub labels: Vec<u16>,
    pub indices: Vec<PatchIndex>,
}

impl<B: Backend> PatchBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub struct PatchBatchIter<'a> {
    dataset: &'a MriSegmentation,
    order: Vec<usize>,
    cursor: usize,
    cfg: PatchLoaderConfig,
    rng: StdRng,
}

impl<'a> PatchBatchIter<'a> {
    pub fn new(dataset: &'a MriSegmentation, cfg: PatchLoaderConfig) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(DatasetError::Other("batch size must be positive".into()));
        }
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if cfg.shuffle {
            order.shuffle(&mut rng);
        }
        Ok(Self {
            dataset,
            order,
            cursor: 0,
            cfg,
            rng,
        })
    }

    /// Number of batches this iterator yields in total.
    pub fn len(&self) -> usize {
        let n = self.order.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<PatchBatch<B>>> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.cfg.drop_last && remaining < self.cfg.batch_size) {
            return Ok(None);
        }
        let end = (self.cursor + self.cfg.batch_size).min(self.order.len());
        let slice = &self.order[self.cursor..end];
        self.cursor = end;

        let patch_shape = self.dataset.patch_shape();
        let orientations: Vec<Orientation> = slice
            .iter()
            .map(|_| {
                if self.cfg.randomize_orientation {
                    Orientation::random(&mut self.rng, patch_shape)
                } else {
                    Orientation::identity()
                }
            })
            .collect();

        let dataset = self.dataset;
        let samples: Vec<PatchSample> = slice
            .par_iter()
            .zip(orientations.par_iter())
            .map(|(&i, orientation)| {
                let mut sample = dataset.get(i).ok_or_else(|| {
                    DatasetError::Other(format!("patch {i} out of range"))
                })?;
                orientation.apply(&mut sample, patch_shape);
                Ok(sample)
            })
            .collect::<DatasetResult<Vec<_>>>()?;

        Ok(Some(assemble_batch(
            samples,
            self.dataset.channels(),
            patch_shape,
            device,
        )))
    }
}

fn assemble_batch<B: Backend>(
    samples: Vec<PatchSample>,
    channels: usize,
    patch_shape: [usize; 3],
    device: &B::Device,
) -> PatchBatch<B> {
    let n = samples.len();
    let voxels = voxel_count(patch_shape);
    let mut data = Vec::with_capacity(n * channels * voxels);
    let mut labels = Vec::with_capacity(n * voxels);
    let mut indices = Vec::with_capacity(n);
    for sample in samples {
        data.extend_from_slice(&sample.data);
        labels.extend_from_slice(&sample.labels);
        indices.push(sample.index);
    }
    let target: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    let [px, py, pz] = patch_shape;
    let data = Tensor::<B, 5>::from_data(TensorData::new(data, [n, channels, px, py, pz]), device);
    let target =
        Tensor::<B, 4, Int>::from_data(TensorData::new(target, [n, px, py, pz]), device);
    PatchBatch {
        data,
        target,
        labels,
        indices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MriDatasetConfig;
    use crate::volume::Volume;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn dataset() -> MriSegmentation {
        let image: Vec<f32> = (0..64).map(|v| v as f32).collect();
        let labels: Vec<u16> = (0..64).map(|v| (v % 2) as u16).collect();
        let vol = Volume::new("a", [4, 4, 4], 1, image, labels).unwrap();
        let cfg = MriDatasetConfig {
            patch_shape: [2, 2, 2],
            randomize_patch_offsets: false,
            seed: Some(3),
            verify_checksums: false,
        };
        MriSegmentation::from_volumes(vec![vol], 2, &cfg).unwrap()
    }

    #[test]
    fn drop_last_controls_batch_count() {
        let ds = dataset();
        let mut cfg = PatchLoaderConfig::inference(3);
        assert_eq!(PatchBatchIter::new(&ds, cfg.clone()).unwrap().len(), 3);
        cfg.drop_last = true;
        let mut iter = PatchBatchIter::new(&ds, cfg).unwrap();
        assert_eq!(iter.len(), 2);
        let device = Default::default();
        let mut seen = 0;
        while let Some(batch) = iter.next_batch::<B>(&device).unwrap() {
            assert_eq!(batch.len(), 3);
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn unshuffled_batches_keep_dataset_order() {
        let ds = dataset();
        let mut iter = PatchBatchIter::new(&ds, PatchLoaderConfig::inference(8)).unwrap();
        let device = Default::default();
        let batch = iter.next_batch::<B>(&device).unwrap().unwrap();
        assert_eq!(batch.data.dims(), [8, 1, 2, 2, 2]);
        assert_eq!(batch.target.dims(), [8, 2, 2, 2]);
        for (k, idx) in batch.indices.iter().enumerate() {
            assert_eq!(idx, ds.patch_index(k).unwrap());
        }
        let host: Vec<i64> = batch.target.into_data().iter::<i64>().collect();
        let expected: Vec<i64> = batch.labels.iter().map(|&l| l as i64).collect();
        assert_eq!(host, expected);
        assert!(iter.next_batch::<B>(&device).unwrap().is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let ds = dataset();
        assert!(PatchBatchIter::new(&ds, PatchLoaderConfig::inference(0)).is_err());
    }
}
