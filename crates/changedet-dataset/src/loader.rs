//! Band and mask loading for change-detection scenes.
//!
//! Each band of a scene is stored as its own single-channel raster; bands are
//! decoded one by one and stacked into a channel-first [`Volume`].

use changedet_core::{Error, Result, Volume};
use image::{DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};

/// Image loader rooted at a dataset directory
#[derive(Debug, Clone)]
pub struct ImageLoader {
    /// Root directory that relative paths are resolved against
    root_dir: PathBuf,
}

impl ImageLoader {
    /// Creates a new image loader
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Gets the full path for an image
    pub fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// Checks if an image file exists
    pub fn exists(&self, path: &Path) -> bool {
        self.full_path(path).exists()
    }

    /// Decodes an image from a path
    pub fn load_image(&self, path: &Path) -> Result<DynamicImage> {
        let full_path = self.full_path(path);

        if !full_path.exists() {
            return Err(Error::NotFound(format!(
                "Image file not found: {}",
                full_path.display()
            )));
        }

        image::open(&full_path).map_err(|e| {
            Error::Image(format!("Failed to load image {}: {}", full_path.display(), e))
        })
    }

    /// Decodes one band file into raw sample values, row-major.
    ///
    /// Only single-channel 8 or 16-bit rasters are accepted; anything else
    /// would need a lossy conversion.
    pub fn load_band(&self, path: &Path) -> Result<(usize, usize, Vec<f32>)> {
        let image = self.load_image(path)?;
        let (width, height) = (image.width() as usize, image.height() as usize);
        let values = match image {
            DynamicImage::ImageLuma8(buffer) => {
                buffer.into_raw().into_iter().map(f32::from).collect()
            }
            DynamicImage::ImageLuma16(buffer) => {
                buffer.into_raw().into_iter().map(f32::from).collect()
            }
            other => {
                return Err(Error::Image(format!(
                    "band {} must be a single-channel 8 or 16-bit raster, found {:?}",
                    self.full_path(path).display(),
                    other.color()
                )))
            }
        };
        Ok((height, width, values))
    }

    /// Decodes and stacks band files into a `[bands, H, W]` volume
    pub fn load_bands(&self, paths: &[PathBuf]) -> Result<Volume<f32>> {
        let mut shape: Option<(usize, usize)> = None;
        let mut data = Vec::new();

        for path in paths {
            let (height, width, values) = self.load_band(path)?;
            match shape {
                None => shape = Some((height, width)),
                Some(expected) if expected != (height, width) => {
                    return Err(Error::Dataset(format!(
                        "band {} is {}x{}, expected {}x{}",
                        path.display(),
                        height,
                        width,
                        expected.0,
                        expected.1
                    )));
                }
                Some(_) => {}
            }
            data.extend(values);
        }

        let (height, width) = shape
            .ok_or_else(|| Error::InvalidArgument("no band files given".to_string()))?;
        Volume::new([paths.len(), height, width], data)
    }

    /// Decodes a change mask as a `[1, H, W]` volume of 0/1 labels
    pub fn load_mask(&self, path: &Path) -> Result<Volume<u8>> {
        let luma = self.load_image(path)?.to_luma8();
        let (width, height) = luma.dimensions();
        let labels = luma.into_raw().into_iter().map(|v| v.min(1)).collect();
        Volume::new([1, height as usize, width as usize], labels)
    }
}
