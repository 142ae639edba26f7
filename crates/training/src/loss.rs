//! Segmentation losses restricted to the valid (non-padding) voxels of each patch.

use crate::metrics::DiceAccumulator;
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use volume_dataset::{voxel_count, PatchIndex, Shape3};

/// Smoothing term of the soft dice ratio.
const DICE_SMOOTH: f32 = 1.0;
const EPS: f32 = 1e-8;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Dice,
    #[value(alias = "cross_entropy")]
    CrossEntropy,
}

/// Per-sample loss terms, `[N, K]` for dice and `[N, 1]` for cross-entropy.
pub struct LossParts<B: Backend> {
    pub numerator: Tensor<B, 2>,
    pub denominator: Tensor<B, 2>,
}

impl<B: Backend> LossParts<B> {
    /// Copy both terms to the host as row-major f64 buffers.
    pub fn to_host(self) -> (Vec<f64>, Vec<f64>) {
        let num = self.numerator.into_data().iter::<f64>().collect();
        let den = self.denominator.into_data().iter::<f64>().collect();
        (num, den)
    }
}

/// `[N, 1, X, Y, Z]` mask, 1 inside each patch's valid box.
pub fn valid_mask<B: Backend>(
    indices: &[PatchIndex],
    patch_shape: Shape3,
    device: &B::Device,
) -> Tensor<B, 5> {
    let voxels = voxel_count(patch_shape);
    let mut mask = vec![0f32; indices.len() * voxels];
    for (j, idx) in indices.iter().enumerate() {
        let base = j * voxels;
        for x in idx.valid_lo[0]..idx.valid_hi[0] {
            for y in idx.valid_lo[1]..idx.valid_hi[1] {
                let row = base + (x * patch_shape[1] + y) * patch_shape[2];
                mask[row + idx.valid_lo[2]..row + idx.valid_hi[2]].fill(1.0);
            }
        }
    }
    let [px, py, pz] = patch_shape;
    Tensor::from_data(
        TensorData::new(mask, [indices.len(), 1, px, py, pz]),
        device,
    )
}

/// `[N, X, Y, Z]` labels → `[N, K, X, Y, Z]` one-hot floats.
pub fn one_hot<B: Backend>(target: Tensor<B, 4, Int>, num_classes: usize) -> Tensor<B, 5> {
    let [n, x, y, z] = target.dims();
    let device = target.device();
    let index = target.reshape([n, 1, x, y, z]);
    Tensor::<B, 5>::zeros([n, num_classes, x, y, z], &device).scatter(
        1,
        index,
        Tensor::ones([n, 1, x, y, z], &device),
    )
}

/// Soft dice terms per sample and class:
/// `num = 2 Σ p·t`, `den = Σ p + Σ t` over valid voxels, `p = softmax(logits)`.
pub fn dice_loss_parts<B: Backend>(
    logits: Tensor<B, 5>,
    target: Tensor<B, 4, Int>,
    mask: Tensor<B, 5>,
) -> LossParts<B> {
    let [n, k, x, y, z] = logits.dims();
    let voxels = x * y * z;
    let probs = softmax(logits, 1) * mask.clone();
    let truth = one_hot(target, k) * mask;
    let numerator = (probs.clone() * truth.clone())
        .reshape([n, k, voxels])
        .sum_dim(2)
        .reshape([n, k])
        .mul_scalar(2.0);
    let denominator = probs.reshape([n, k, voxels]).sum_dim(2).reshape([n, k])
        + truth.reshape([n, k, voxels]).sum_dim(2).reshape([n, k]);
    LossParts {
        numerator,
        denominator,
    }
}

/// Weighted cross-entropy terms per sample:
/// `num = -Σ w·log p_target`, `den = Σ w` over valid voxels.
pub fn cross_entropy_parts<B: Backend>(
    logits: Tensor<B, 5>,
    target: Tensor<B, 4, Int>,
    mask: Tensor<B, 5>,
    class_weight: Option<Tensor<B, 1>>,
) -> LossParts<B> {
    let [n, _k, x, y, z] = logits.dims();
    let voxels = x * y * z;
    let log_probs = log_softmax(logits, 1);
    let picked = log_probs.gather(1, target.clone().reshape([n, 1, x, y, z]));
    let weight = match class_weight {
        Some(w) => w.select(0, target.reshape([n * voxels])).reshape([n, 1, x, y, z]) * mask,
        None => mask,
    };
    let numerator = (picked * weight.clone())
        .reshape([n, voxels])
        .sum_dim(1)
        .neg();
    let denominator = weight.reshape([n, voxels]).sum_dim(1);
    LossParts {
        numerator,
        denominator,
    }
}

/// Inverse-frequency class weights normalized to mean 1 over present classes:
/// `w_c = (1 / count_c) * Σcount / K`. Classes that never occur get weight 0.
pub fn class_weights(class_count: &[u64]) -> Vec<f32> {
    let k = class_count.len().max(1) as f64;
    let total: u64 = class_count.iter().sum();
    class_count
        .iter()
        .map(|&c| {
            if c == 0 {
                0.0
            } else {
                ((1.0 / c as f64) * total as f64 / k) as f32
            }
        })
        .collect()
}

/// The configured loss, independent of backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationLoss {
    pub kind: LossKind,
    /// Per-class weights for cross-entropy.
    pub class_weight: Option<Vec<f32>>,
}

impl SegmentationLoss {
    pub fn new(kind: LossKind, class_weight: Option<Vec<f32>>) -> Self {
        Self { kind, class_weight }
    }

    /// Width of a `LossParts` row for `num_classes` outputs.
    pub fn parts_width(&self, num_classes: usize) -> usize {
        match self.kind {
            LossKind::Dice => num_classes,
            LossKind::CrossEntropy => 1,
        }
    }

    pub fn parts<B: Backend>(
        &self,
        logits: Tensor<B, 5>,
        target: Tensor<B, 4, Int>,
        mask: Tensor<B, 5>,
    ) -> LossParts<B> {
        match self.kind {
            LossKind::Dice => dice_loss_parts(logits, target, mask),
            LossKind::CrossEntropy => {
                let device = logits.device();
                let weight = self.class_weight.as_ref().map(|w| {
                    Tensor::<B, 1>::from_data(TensorData::new(w.clone(), [w.len()]), &device)
                });
                cross_entropy_parts(logits, target, mask, weight)
            }
        }
    }

    /// Differentiable scalar (`[1]`) loss for one batch.
    ///
    /// Dice: `1 - mean_k((Σ_n num + s) / (Σ_n den + s))`.
    /// Cross-entropy: `Σ num / Σ den`.
    pub fn reduce<B: Backend>(&self, parts: LossParts<B>) -> Tensor<B, 1> {
        match self.kind {
            LossKind::Dice => {
                let num = parts.numerator.sum_dim(0).add_scalar(DICE_SMOOTH);
                let den = parts.denominator.sum_dim(0).add_scalar(DICE_SMOOTH);
                (num / den).mean().neg().add_scalar(1.0)
            }
            LossKind::CrossEntropy => {
                parts.numerator.sum() / parts.denominator.sum().add_scalar(EPS)
            }
        }
    }

    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 5>,
        target: Tensor<B, 4, Int>,
        mask: Tensor<B, 5>,
    ) -> Tensor<B, 1> {
        self.reduce(self.parts(logits, target, mask))
    }

    /// Dataset-level loss from accumulated terms.
    pub fn aggregate(&self, acc: &DiceAccumulator) -> Option<f64> {
        match self.kind {
            LossKind::Dice => acc.mean().map(|dice| 1.0 - dice),
            LossKind::CrossEntropy => acc.pooled(),
        }
    }
}

/// Running loss terms over a whole pass of a dataset.
#[derive(Debug, Clone)]
pub struct LossAccumulator {
    loss: SegmentationLoss,
    parts: DiceAccumulator,
}

impl LossAccumulator {
    pub fn new(loss: &SegmentationLoss, num_classes: usize) -> Self {
        Self {
            loss: loss.clone(),
            parts: DiceAccumulator::new(loss.parts_width(num_classes)),
        }
    }

    pub fn push<B: Backend>(&mut self, parts: LossParts<B>) {
        let (num, den) = parts.to_host();
        self.parts.push_rows(&num, &den);
    }

    /// Dataset-level loss, `NaN` when nothing was accumulated.
    pub fn value(&self) -> f64 {
        self.loss.aggregate(&self.parts).unwrap_or(f64::NAN)
    }
}
