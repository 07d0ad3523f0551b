//! Normalization statistics for Sentinel-2 band sets.
//!
//! Chips stack the pre and post images along the channel axis, so every
//! per-band table is applied twice: once to each half.

use burn::prelude::*;
use changedet_core::{BandSet, Result};
use serde::{Deserialize, Serialize};

use crate::transforms::{NormalizeImage, ScaleImage};

/// Raw Sentinel-2 reflectances are stored scaled by this factor
pub const REFLECTANCE_SCALE: f32 = 10000.0;

const RGB_MEAN: [f32; 3] = [1298.9539, 1284.8223, 1365.5087];
const RGB_STD: [f32; 3] = [765.5303, 537.6539, 414.6901];

const ALL_MEAN: [f32; 13] = [
    1571.1372, 1365.5087, 1284.8223, 1298.9539, 1431.2260, 1860.9531, 2081.9634, 1994.7665,
    2214.5986, 641.4485, 14.3672, 1957.3165, 1419.6107,
];
const ALL_STD: [f32; 13] = [
    274.9591, 414.6901, 537.6539, 765.5303, 724.2261, 760.2133, 848.7888, 866.8081, 920.1696,
    322.1572, 8.6878, 1019.1249, 872.1970,
];

/// Per-channel mean and standard deviation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ChannelStatistics {
    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Repeats the table so it covers a pre/post stacked image
    pub fn doubled(&self) -> Self {
        Self {
            mean: self.mean.repeat(2),
            std: self.std.repeat(2),
        }
    }

    pub fn to_transform(&self) -> Result<NormalizeImage> {
        NormalizeImage::new(self.mean.clone(), self.std.clone())
    }
}

/// Mean/std of a single image of `bands`
pub fn normalization_values(bands: BandSet) -> ChannelStatistics {
    let (mean, std): (&[f32], &[f32]) = match bands {
        BandSet::Rgb => (&RGB_MEAN, &RGB_STD),
        BandSet::All => (&ALL_MEAN, &ALL_STD),
    };
    ChannelStatistics {
        mean: mean.to_vec(),
        std: std.to_vec(),
    }
}

/// Normalization for chips of `bands`, covering both stacked images
pub fn normalize_transform(bands: BandSet) -> Result<NormalizeImage> {
    normalization_values(bands).doubled().to_transform()
}

/// Scales raw reflectances into `[0, 1]`
pub fn scale_transform() -> ScaleImage {
    ScaleImage::reflectance()
}

/// Normalizes a `[batch, channels, height, width]` tensor per channel
pub fn normalize_batch<B: Backend>(
    images: Tensor<B, 4>,
    statistics: &ChannelStatistics,
) -> Tensor<B, 4> {
    let device = images.device();
    let channels = statistics.channels();
    let mean = Tensor::<B, 4>::from_floats(
        TensorData::new(statistics.mean.clone(), [1, channels, 1, 1]),
        &device,
    );
    let std = Tensor::<B, 4>::from_floats(
        TensorData::new(statistics.std.clone(), [1, channels, 1, 1]),
        &device,
    );
    (images - mean) / std
}
