//! Dice aggregation over whole datasets.
//!
//! Scores are accumulated as per-class numerator/denominator sums and only
//! divided at the end, so small batches or thin structures do not skew the
//! dataset-level value. Sums are kept in f64.

use volume_dataset::{voxel_count, PatchIndex, Shape3};

/// Hard-label dice terms for one prediction/truth pair.
///
/// `num[c] = 2 |P_c ∩ T_c|`, `den[c] = |P_c| + |T_c|`. Labels outside
/// `0..num_classes` are ignored.
pub fn binary_dice_parts<P, T>(pred: P, truth: T, num_classes: usize) -> (Vec<f64>, Vec<f64>)
where
    P: IntoIterator,
    P::Item: Into<i64>,
    T: IntoIterator,
    T::Item: Into<i64>,
{
    let mut num = vec![0f64; num_classes];
    let mut den = vec![0f64; num_classes];
    let class = |v: i64| (v >= 0 && (v as usize) < num_classes).then_some(v as usize);
    for (p, t) in pred.into_iter().zip(truth) {
        let (p, t) = (class(p.into()), class(t.into()));
        if let Some(p) = p {
            den[p] += 1.0;
        }
        if let Some(t) = t {
            den[t] += 1.0;
        }
        if let (Some(p), Some(t)) = (p, t) {
            if p == t {
                num[p] += 2.0;
            }
        }
    }
    (num, den)
}

/// Per-class numerator/denominator sums.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceAccumulator {
    numerator: Vec<f64>,
    denominator: Vec<f64>,
}

impl DiceAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            numerator: vec![0.0; num_classes],
            denominator: vec![0.0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.numerator.len()
    }

    pub fn push(&mut self, numerator: &[f64], denominator: &[f64]) {
        debug_assert_eq!(numerator.len(), self.numerator.len());
        debug_assert_eq!(denominator.len(), self.denominator.len());
        for (acc, v) in self.numerator.iter_mut().zip(numerator) {
            *acc += v;
        }
        for (acc, v) in self.denominator.iter_mut().zip(denominator) {
            *acc += v;
        }
    }

    /// Push row-major `[rows, num_classes]` buffers, e.g. per-sample loss terms.
    pub fn push_rows(&mut self, numerator: &[f64], denominator: &[f64]) {
        let k = self.num_classes().max(1);
        for (num, den) in numerator.chunks(k).zip(denominator.chunks(k)) {
            self.push(num, den);
        }
    }

    pub fn merge(&mut self, other: &DiceAccumulator) {
        self.push(&other.numerator, &other.denominator);
    }

    /// `Σnum / Σden` per class; `None` where the class never occurred.
    pub fn per_class(&self) -> Vec<Option<f64>> {
        self.numerator
            .iter()
            .zip(&self.denominator)
            .map(|(n, d)| (*d > 0.0).then(|| n / d))
            .collect()
    }

    /// Mean of the per-class ratios over classes that occurred at all.
    pub fn mean(&self) -> Option<f64> {
        let ratios: Vec<f64> = self.per_class().into_iter().flatten().collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }

    /// Ratio of the class-summed numerator to the class-summed denominator.
    pub fn pooled(&self) -> Option<f64> {
        let den: f64 = self.denominator.iter().sum();
        (den > 0.0).then(|| self.numerator.iter().sum::<f64>() / den)
    }
}

/// Dice over the valid boxes of a batch of patch predictions.
///
/// `pred` and `truth` are sample-major buffers of `indices.len()` patches.
pub fn masked_patch_dice(
    pred: &[i64],
    truth: &[u16],
    indices: &[PatchIndex],
    patch_shape: Shape3,
    num_classes: usize,
) -> DiceAccumulator {
    let voxels = voxel_count(patch_shape);
    let mut acc = DiceAccumulator::new(num_classes);
    for (j, idx) in indices.iter().enumerate() {
        let base = j * voxels;
        let mut p = Vec::with_capacity(idx.valid_voxels());
        let mut t = Vec::with_capacity(idx.valid_voxels());
        for x in idx.valid_lo[0]..idx.valid_hi[0] {
            for y in idx.valid_lo[1]..idx.valid_hi[1] {
                let row = base + (x * patch_shape[1] + y) * patch_shape[2];
                for z in idx.valid_lo[2]..idx.valid_hi[2] {
                    p.push(pred[row + z]);
                    t.push(truth[row + z] as i64);
                }
            }
        }
        let (num, den) = binary_dice_parts(p, t, num_classes);
        acc.push(&num, &den);
    }
    acc
}
