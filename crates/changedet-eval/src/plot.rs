//! Prediction rendering.
//!
//! A rendering is a 3 x 2 mosaic of equally sized panels:
//!
//! | pre + ground truth   | post + ground truth   |
//! | pre + prediction     | post + prediction     |
//! | predicted mask       | ground-truth mask     |

use std::path::Path;

use changedet_core::{BandSet, Error, Result, Volume};
use image::{GenericImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Rendering options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Band set of the chip, used to pick the red, green and blue channels
    pub bands: BandSet,
    /// Probability above which a pixel is drawn as changed
    pub threshold: f32,
    /// Opacity of mask overlays
    pub alpha: f32,
    /// Overlay colour
    pub color: [u8; 3],
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            bands: BandSet::Rgb,
            threshold: 0.5,
            alpha: 0.4,
            color: [0, 0, 255],
        }
    }
}

/// `q`-th percentile (0..=100) with linear interpolation between ranks
fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Stretches three channels of `image` (starting at `offset`) to 8-bit RGB
/// between their joint 2nd and 98th percentiles
fn stretch_rgb(image: &Volume<f32>, offset: usize, bands: BandSet) -> RgbImage {
    let (height, width) = (image.height(), image.width());
    let channels = bands.rgb_indices().map(|c| image.plane(offset + c));

    let mut values: Vec<f32> = channels.iter().flat_map(|p| p.iter().copied()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    let low = percentile(&values, 2.0);
    let high = percentile(&values, 98.0);
    let range = high - low;

    let scale = |v: f32| -> u8 {
        let normalized = if range > 0.0 { (v - low) / range } else { 0.0 };
        (normalized.clamp(0.0, 1.0) * 255.0) as u8
    };

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([scale(channels[0][i]), scale(channels[1][i]), scale(channels[2][i])])
    })
}

/// Blends `color` into every pixel where `mask` is set
fn overlay(mut image: RgbImage, mask: &[bool], color: [u8; 3], alpha: f32) -> RgbImage {
    let width = image.width() as usize;
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if mask[y as usize * width + x as usize] {
            for (channel, target) in pixel.0.iter_mut().zip(color) {
                *channel = (f32::from(*channel) * (1.0 - alpha) + f32::from(target) * alpha)
                    .round() as u8;
            }
        }
    }
    image
}

fn mask_image(mask: &[bool], width: usize, height: usize) -> RgbImage {
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let v = if mask[y as usize * width + x as usize] {
            255
        } else {
            0
        };
        Rgb([v, v, v])
    })
}

/// Renders a chip, its ground truth and a `[H * W]` probability map as one mosaic
pub fn render_prediction(
    image: &Volume<f32>,
    mask: &Volume<i64>,
    probabilities: &[f32],
    options: &RenderOptions,
) -> Result<RgbImage> {
    let [channels, height, width] = image.shape();
    let bands = options.bands.channel_count();
    if channels != 2 * bands {
        return Err(Error::InvalidArgument(format!(
            "expected {} channels for {} bands, got {}",
            2 * bands,
            options.bands,
            channels
        )));
    }
    if mask.shape() != [1, height, width] || probabilities.len() != height * width {
        return Err(Error::InvalidArgument(format!(
            "mask {:?} and {} probabilities do not match image {:?}",
            mask.shape(),
            probabilities.len(),
            image.shape()
        )));
    }

    let truth: Vec<bool> = mask.data().iter().map(|v| *v > 0).collect();
    let predicted: Vec<bool> = probabilities.iter().map(|p| *p > options.threshold).collect();
    let pre = stretch_rgb(image, 0, options.bands);
    let post = stretch_rgb(image, bands, options.bands);

    let panels = [
        overlay(pre.clone(), &truth, options.color, options.alpha),
        overlay(post.clone(), &truth, options.color, options.alpha),
        overlay(pre, &predicted, options.color, options.alpha),
        overlay(post, &predicted, options.color, options.alpha),
        mask_image(&predicted, width, height),
        mask_image(&truth, width, height),
    ];

    let (w, h) = (width as u32, height as u32);
    let mut mosaic = RgbImage::new(2 * w, 3 * h);
    for (i, panel) in panels.iter().enumerate() {
        let (col, row) = ((i % 2) as u32, (i / 2) as u32);
        mosaic
            .copy_from(panel, col * w, row * h)
            .map_err(|e| Error::Image(e.to_string()))?;
    }
    Ok(mosaic)
}

/// Renders a prediction and saves it as PNG
pub fn save_prediction(
    path: &Path,
    image: &Volume<f32>,
    mask: &Volume<i64>,
    probabilities: &[f32],
    options: &RenderOptions,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    render_prediction(image, mask, probabilities, options)?.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chip() -> (Volume<f32>, Volume<i64>) {
        // 2x2 pixels, 3 pre bands then 3 post bands
        let image = Volume::new(
            [6, 2, 2],
            (0..24).map(|i| (i % 4) as f32 * 100.0).collect(),
        )
        .unwrap();
        let mask = Volume::new([1, 2, 2], vec![0, 1, 0, 0]).unwrap();
        (image, mask)
    }

    #[test]
    fn test_percentile() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 0.0);
        assert_eq!(percentile(&values, 50.0), 2.0);
        assert!((percentile(&values, 98.0) - 3.92).abs() < 1e-5);
    }

    #[test]
    fn test_mosaic_layout() {
        let (image, mask) = chip();
        let options = RenderOptions::default();
        let mosaic = render_prediction(&image, &mask, &[0.9, 0.9, 0.1, 0.1], &options).unwrap();

        assert_eq!(mosaic.dimensions(), (4, 6));
        // predicted mask panel (bottom left) is white where p > threshold
        assert_eq!(mosaic.get_pixel(0, 4), &Rgb([255, 255, 255]));
        assert_eq!(mosaic.get_pixel(0, 5), &Rgb([0, 0, 0]));
        // ground-truth panel (bottom right)
        assert_eq!(mosaic.get_pixel(3, 4), &Rgb([255, 255, 255]));
        assert_eq!(mosaic.get_pixel(2, 4), &Rgb([0, 0, 0]));
        // overlay tints the changed pixel toward blue
        let tinted = mosaic.get_pixel(1, 0);
        let plain = mosaic.get_pixel(0, 1);
        assert!(tinted[2] > tinted[0]);
        assert_eq!(plain[0], plain[2]);
    }

    #[test]
    fn test_render_rejects_mismatch() {
        let (image, mask) = chip();
        let options = RenderOptions {
            bands: BandSet::All,
            ..Default::default()
        };
        assert!(render_prediction(&image, &mask, &[0.0; 4], &options).is_err());
        assert!(render_prediction(&image, &mask, &[0.0; 3], &RenderOptions::default()).is_err());
    }

    #[test]
    fn test_save_prediction() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("renders/chip_0.png");
        let (image, mask) = chip();
        save_prediction(&path, &image, &mask, &[0.0; 4], &RenderOptions::default()).unwrap();
        assert!(path.exists());
    }
}
