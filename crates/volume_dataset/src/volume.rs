//! In-memory MRI volume with its label map.

use crate::types::{voxel_count, DatasetError, DatasetResult, Shape3};

#[derive(Debug, Clone)]
pub struct Volume {
    pub subject: String,
    pub shape: Shape3,
    pub channels: usize,
    /// Intensities in C, X, Y, Z order.
    pub image: Vec<f32>,
    /// Class labels in X, Y, Z order.
    pub labels: Vec<u16>,
}

impl Volume {
    pub fn new(
        subject: impl Into<String>,
        shape: Shape3,
        channels: usize,
        image: Vec<f32>,
        labels: Vec<u16>,
    ) -> DatasetResult<Self> {
        let subject = subject.into();
        let voxels = voxel_count(shape);
        if voxels == 0 || channels == 0 {
            return Err(DatasetError::Shape(format!(
                "volume {subject} has empty shape {shape:?} x {channels} channels"
            )));
        }
        if image.len() != voxels * channels {
            return Err(DatasetError::Shape(format!(
                "volume {subject}: image buffer has {} values, expected {}",
                image.len(),
                voxels * channels
            )));
        }
        if labels.len() != voxels {
            return Err(DatasetError::Shape(format!(
                "volume {subject}: label buffer has {} values, expected {voxels}",
                labels.len()
            )));
        }
        Ok(Self {
            subject,
            shape,
            channels,
            image,
            labels,
        })
    }

    pub fn voxel_count(&self) -> usize {
        voxel_count(self.shape)
    }

    #[inline]
    pub fn linear_index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.shape[1] + y) * self.shape[2] + z
    }

    pub fn label_at(&self, x: usize, y: usize, z: usize) -> u16 {
        self.labels[self.linear_index(x, y, z)]
    }

    pub fn intensity_at(&self, channel: usize, x: usize, y: usize, z: usize) -> f32 {
        self.image[channel * self.voxel_count() + self.linear_index(x, y, z)]
    }

    /// Histogram of labels; labels at or above `num_classes` are ignored.
    pub fn class_count(&self, num_classes: usize) -> Vec<u64> {
        let mut counts = vec![0u64; num_classes];
        for &label in &self.labels {
            if let Some(slot) = counts.get_mut(label as usize) {
                *slot += 1;
            }
        }
        counts
    }

    pub fn validate_labels(&self, num_classes: usize) -> DatasetResult<()> {
        match self.labels.iter().copied().max() {
            Some(label) if label as usize >= num_classes => Err(DatasetError::LabelOutOfRange {
                subject: self.subject.clone(),
                label,
                num_classes,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape3) -> Volume {
        let n = voxel_count(shape);
        let image = (0..n).map(|v| v as f32).collect();
        let labels = (0..n).map(|v| (v % 3) as u16).collect();
        Volume::new("ramp", shape, 1, image, labels).unwrap()
    }

    #[test]
    fn indexing_is_x_major() {
        let vol = ramp([2, 3, 4]);
        assert_eq!(vol.linear_index(1, 2, 3), 23);
        assert_eq!(vol.intensity_at(0, 1, 0, 0), 12.0);
        assert_eq!(vol.label_at(0, 0, 2), 2);
    }

    #[test]
    fn class_count_sums_to_voxels() {
        let vol = ramp([3, 3, 3]);
        let counts = vol.class_count(4);
        assert_eq!(counts, vec![9, 9, 9, 0]);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let err = Volume::new("bad", [2, 2, 2], 1, vec![0.0; 7], vec![0; 8]).unwrap_err();
        assert!(matches!(err, DatasetError::Shape(_)));
    }

    #[test]
    fn label_range_is_checked() {
        let vol = ramp([2, 2, 2]);
        assert!(vol.validate_labels(3).is_ok());
        assert!(matches!(
            vol.validate_labels(2),
            Err(DatasetError::LabelOutOfRange { label: 2, .. })
        ));
    }
}
