//! Offline per-band statistics over a set of scenes.

use changedet_core::{Error, Result, Volume};
use rayon::prelude::*;
use tracing::info;

use crate::manifest::SceneProvider;
use crate::normalization::ChannelStatistics;

/// Running per-channel sums
#[derive(Debug, Clone, PartialEq)]
struct ChannelSums {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    pixels: u64,
}

impl ChannelSums {
    fn new(channels: usize) -> Self {
        Self {
            sum: vec![0.0; channels],
            sum_sq: vec![0.0; channels],
            pixels: 0,
        }
    }

    /// Adds every pixel of `image`; pixels are counted once per image, not per channel
    fn add(&mut self, image: &Volume<f32>) {
        for c in 0..image.channels() {
            for &v in image.plane(c) {
                let v = f64::from(v);
                self.sum[c] += v;
                self.sum_sq[c] += v * v;
            }
        }
        self.pixels += (image.height() * image.width()) as u64;
    }

    fn merge(mut self, other: Self) -> Self {
        for c in 0..self.sum.len() {
            self.sum[c] += other.sum[c];
            self.sum_sq[c] += other.sum_sq[c];
        }
        self.pixels += other.pixels;
        self
    }

    fn finish(self) -> Result<ChannelStatistics> {
        if self.pixels == 0 {
            return Err(Error::Dataset(
                "cannot compute statistics over zero pixels".to_string(),
            ));
        }
        let n = self.pixels as f64;
        let mean: Vec<f64> = self.sum.iter().map(|s| s / n).collect();
        let std = self
            .sum_sq
            .iter()
            .zip(&mean)
            .map(|(sq, m)| ((sq / n - m * m).max(0.0)).sqrt() as f32)
            .collect();
        Ok(ChannelStatistics {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            std,
        })
    }
}

/// Per-band mean and standard deviation over the pre and post images of every scene
pub fn compute_mean_std(provider: &dyn SceneProvider) -> Result<ChannelStatistics> {
    let channels = provider.bands().channel_count();

    let sums = (0..provider.len())
        .into_par_iter()
        .map(|scene| -> Result<ChannelSums> {
            let data = provider.load_scene(scene)?;
            let mut sums = ChannelSums::new(channels);
            sums.add(&data.pre);
            sums.add(&data.post);
            Ok(sums)
        })
        .try_reduce(|| ChannelSums::new(channels), |a, b| Ok(a.merge(b)))?;

    info!(
        "Computed statistics for {} bands over {} scenes ({} pixels)",
        channels,
        provider.len(),
        sums.pixels
    );
    sums.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{InMemoryProvider, SceneData};
    use changedet_core::BandSet;

    fn constant_scene(pre: [f32; 3], post: [f32; 3]) -> SceneData {
        let fill = |values: [f32; 3]| {
            Volume::new(
                [3, 2, 2],
                values.iter().flat_map(|v| std::iter::repeat(*v).take(4)).collect(),
            )
            .unwrap()
        };
        SceneData::new(fill(pre), fill(post), Volume::filled([1, 2, 2], 0)).unwrap()
    }

    #[test]
    fn test_mean_std_over_pre_and_post() {
        let provider = InMemoryProvider::new(BandSet::Rgb)
            .with_scene("a", constant_scene([1.0, 10.0, 5.0], [3.0, 10.0, 5.0]))
            .unwrap()
            .with_scene("b", constant_scene([1.0, 20.0, 5.0], [3.0, 20.0, 5.0]))
            .unwrap();

        let stats = compute_mean_std(&provider).unwrap();
        assert_eq!(stats.channels(), 3);
        assert!((stats.mean[0] - 2.0).abs() < 1e-6);
        assert!((stats.std[0] - 1.0).abs() < 1e-6);
        assert!((stats.mean[1] - 15.0).abs() < 1e-6);
        assert!((stats.std[1] - 5.0).abs() < 1e-6);
        assert_eq!(stats.std[2], 0.0);
    }

    #[test]
    fn test_empty_provider() {
        let provider = InMemoryProvider::new(BandSet::Rgb);
        assert!(compute_mean_std(&provider).is_err());
    }
}
