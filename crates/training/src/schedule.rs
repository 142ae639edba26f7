//! Learning-rate schedule.

use burn::lr_scheduler::LrScheduler;
use burn::tensor::backend::Backend;
use burn::LearningRate;

/// Constant learning rate until `decay_start`, then exponential decay.
///
/// Stepped once per epoch: the n-th call to [`LrScheduler::step`] returns the
/// rate for epoch `n - 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialSchedule {
    pub initial_lr: LearningRate,
    pub decay_start: usize,
    pub decay_base: f64,
    epoch: usize,
}

impl ExponentialSchedule {
    pub fn new(initial_lr: LearningRate, decay_start: usize, decay_base: f64) -> Self {
        Self {
            initial_lr,
            decay_start,
            decay_base,
            epoch: 0,
        }
    }

    /// Epoch whose rate the next `step` returns.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn rate_at(&self, epoch: usize) -> LearningRate {
        match epoch.checked_sub(self.decay_start) {
            None => self.initial_lr,
            Some(steps) => self.initial_lr * self.decay_base.powi(steps as i32),
        }
    }
}

impl LrScheduler for ExponentialSchedule {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.rate_at(self.epoch);
        self.epoch += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.epoch
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.epoch = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    fn take(s: &mut ExponentialSchedule, n: usize) -> Vec<f64> {
        (0..n).map(|_| s.step()).collect()
    }

    #[test]
    fn holds_then_decays() {
        let mut s = ExponentialSchedule::new(1e-2, 2, 0.5);
        let lrs = take(&mut s, 6);
        assert_eq!(&lrs[..3], &[1e-2, 1e-2, 1e-2]);
        assert!((lrs[3] - 5e-3).abs() < 1e-15);
        assert!((lrs[5] - 1.25e-3).abs() < 1e-15);
        assert_eq!(s.epoch(), 6);
    }

    #[test]
    fn unit_base_is_constant() {
        let mut s = ExponentialSchedule::new(3e-4, 1, 1.0);
        assert!(take(&mut s, 10).into_iter().all(|lr| lr == 3e-4));
    }

    #[test]
    fn decay_from_first_epoch() {
        let mut s = ExponentialSchedule::new(1.0, 0, 0.1);
        let lrs = take(&mut s, 3);
        assert_eq!(lrs[0], 1.0);
        assert!((lrs[2] - 1e-2).abs() < 1e-15);
    }

    #[test]
    fn restored_schedule_resumes_at_saved_epoch() {
        let mut s = ExponentialSchedule::new(1e-2, 1, 0.5);
        take(&mut s, 3);
        let record = LrScheduler::to_record::<NdArray<f32>>(&s);
        let mut restored = ExponentialSchedule::new(1e-2, 1, 0.5)
            .load_record::<NdArray<f32>>(record);
        assert_eq!(restored.epoch(), 3);
        assert_eq!(restored.step(), s.step());
    }
}
