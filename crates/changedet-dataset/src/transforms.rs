//! Per-chip transforms.
//!
//! Transforms run on every chip right after it is cut from its scene. They
//! only touch the image; the mask is passed through unchanged.

use std::fmt;
use std::sync::Arc;

use changedet_core::{Error, Result};

use crate::chipped::Chip;
use crate::normalization::REFLECTANCE_SCALE;

/// A transformation applied to each materialized chip
pub trait ChipTransform: Send + Sync {
    fn apply(&self, chip: Chip) -> Result<Chip>;
}

/// Transform shared between datasets and dataloader workers
pub type SharedTransform = Arc<dyn ChipTransform>;

impl<F> ChipTransform for F
where
    F: Fn(Chip) -> Result<Chip> + Send + Sync,
{
    fn apply(&self, chip: Chip) -> Result<Chip> {
        self(chip)
    }
}

/// Divides every image value by a constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleImage {
    divisor: f32,
}

impl ScaleImage {
    pub fn new(divisor: f32) -> Result<Self> {
        if divisor == 0.0 || !divisor.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "scale divisor must be finite and non-zero, got {divisor}"
            )));
        }
        Ok(Self { divisor })
    }

    /// Divides raw Sentinel-2 reflectances by their storage scale
    pub fn reflectance() -> Self {
        Self {
            divisor: REFLECTANCE_SCALE,
        }
    }

    pub fn divisor(&self) -> f32 {
        self.divisor
    }
}

impl ChipTransform for ScaleImage {
    fn apply(&self, chip: Chip) -> Result<Chip> {
        let divisor = self.divisor;
        Ok(Chip {
            image: chip.image.map(|v| v / divisor),
            mask: chip.mask,
        })
    }
}

/// Per-channel `(x - mean) / std`
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeImage {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl NormalizeImage {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(Error::InvalidArgument(format!(
                "mean has {} channels but std has {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| *s == 0.0) {
            return Err(Error::InvalidArgument(
                "standard deviation must be non-zero".to_string(),
            ));
        }
        Ok(Self { mean, std })
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }
}

impl ChipTransform for NormalizeImage {
    fn apply(&self, chip: Chip) -> Result<Chip> {
        let [channels, height, width] = chip.image.shape();
        if channels != self.mean.len() {
            return Err(Error::InvalidArgument(format!(
                "normalization expects {} channels, chip has {}",
                self.mean.len(),
                channels
            )));
        }
        let plane = height * width;
        let data = chip
            .image
            .data()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let c = i / plane;
                (v - self.mean[c]) / self.std[c]
            })
            .collect();
        Ok(Chip {
            image: changedet_core::Volume::new([channels, height, width], data)?,
            mask: chip.mask,
        })
    }
}

/// Applies transforms in order
#[derive(Clone, Default)]
pub struct Compose {
    transforms: Vec<SharedTransform>,
}

impl Compose {
    pub fn new(transforms: Vec<SharedTransform>) -> Self {
        Self { transforms }
    }

    pub fn then(mut self, transform: impl ChipTransform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl fmt::Debug for Compose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compose")
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

impl ChipTransform for Compose {
    fn apply(&self, chip: Chip) -> Result<Chip> {
        self.transforms
            .iter()
            .try_fold(chip, |chip, transform| transform.apply(chip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changedet_core::Volume;

    fn chip(values: Vec<f32>, channels: usize) -> Chip {
        let side = ((values.len() / channels) as f64).sqrt() as usize;
        Chip {
            image: Volume::new([channels, side, side], values).unwrap(),
            mask: Volume::filled([1, side, side], 1i64),
        }
    }

    #[test]
    fn test_scale_image() {
        let scaled = ScaleImage::new(10000.0)
            .unwrap()
            .apply(chip(vec![10000.0, 5000.0, 0.0, 2500.0], 1))
            .unwrap();
        assert_eq!(scaled.image.data(), &[1.0, 0.5, 0.0, 0.25]);
        assert_eq!(scaled.mask.data(), &[1, 1, 1, 1]);
        assert!(ScaleImage::new(0.0).is_err());
    }

    #[test]
    fn test_normalize_per_channel() {
        let normalize = NormalizeImage::new(vec![1.0, 10.0], vec![1.0, 2.0]).unwrap();
        let out = normalize
            .apply(chip(vec![1.0, 2.0, 3.0, 4.0, 10.0, 12.0, 14.0, 16.0], 2))
            .unwrap();
        assert_eq!(out.image.data(), &[0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_normalize_channel_mismatch() {
        let normalize = NormalizeImage::new(vec![0.0; 3], vec![1.0; 3]).unwrap();
        assert!(normalize.apply(chip(vec![0.0; 8], 2)).is_err());
        assert!(NormalizeImage::new(vec![0.0], vec![1.0, 1.0]).is_err());
        assert!(NormalizeImage::new(vec![0.0], vec![0.0]).is_err());
    }

    #[test]
    fn test_compose_order() {
        let pipeline = Compose::default()
            .then(ScaleImage::new(2.0).unwrap())
            .then(|mut c: Chip| -> Result<Chip> {
                c.image = c.image.map(|v| v + 1.0);
                Ok(c)
            });
        assert_eq!(pipeline.len(), 2);
        let out = pipeline.apply(chip(vec![2.0, 4.0, 6.0, 8.0], 1)).unwrap();
        assert_eq!(out.image.data(), &[2.0, 3.0, 4.0, 5.0]);
    }
}
