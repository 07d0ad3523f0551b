//! Core type definitions shared across the workspace.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Spectral band selection for a scene.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BandSet {
    /// Red, green and blue (Sentinel-2 B04, B03, B02)
    #[default]
    Rgb,
    /// All 13 Sentinel-2 bands
    All,
}

impl BandSet {
    const RGB_BANDS: [&'static str; 3] = ["B04", "B03", "B02"];
    const ALL_BANDS: [&'static str; 13] = [
        "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11",
        "B12",
    ];

    /// Number of channels in one image of this band set
    pub fn channel_count(&self) -> usize {
        self.band_names().len()
    }

    /// Band file names, in channel order
    pub fn band_names(&self) -> &'static [&'static str] {
        match self {
            BandSet::Rgb => &Self::RGB_BANDS,
            BandSet::All => &Self::ALL_BANDS,
        }
    }

    /// Channel indices of the red, green and blue bands inside one image
    pub fn rgb_indices(&self) -> [usize; 3] {
        match self {
            BandSet::Rgb => [0, 1, 2],
            BandSet::All => [3, 2, 1],
        }
    }
}

impl std::fmt::Display for BandSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandSet::Rgb => write!(f, "rgb"),
            BandSet::All => write!(f, "all"),
        }
    }
}

impl FromStr for BandSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rgb" => Ok(BandSet::Rgb),
            "all" => Ok(BandSet::All),
            other => Err(Error::InvalidArgument(format!(
                "unknown band set '{other}', expected 'rgb' or 'all'"
            ))),
        }
    }
}

/// Dataset split as stored on disk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training scenes
    #[default]
    Train,
    /// Held-out test scenes
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            other => Err(Error::InvalidArgument(format!(
                "unknown split '{other}', expected 'train' or 'test'"
            ))),
        }
    }
}

/// Lifecycle stage of the data module
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Fit, Stage::Validate, Stage::Test, Stage::Predict];

    /// On-disk split a stage reads from
    pub fn split(&self) -> Split {
        match self {
            Stage::Fit | Stage::Validate => Split::Train,
            Stage::Test | Stage::Predict => Split::Test,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fit => write!(f, "fit"),
            Stage::Validate => write!(f, "validate"),
            Stage::Test => write!(f, "test"),
            Stage::Predict => write!(f, "predict"),
        }
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fit" => Ok(Stage::Fit),
            "validate" => Ok(Stage::Validate),
            "test" => Ok(Stage::Test),
            "predict" => Ok(Stage::Predict),
            other => Err(Error::InvalidArgument(format!("unknown stage '{other}'"))),
        }
    }
}

/// Dense channel-first (CHW) array.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    shape: [usize; 3],
    data: Vec<T>,
}

impl<T: Copy> Volume<T> {
    /// Wraps `data` laid out as `[channels, height, width]`
    pub fn new(shape: [usize; 3], data: Vec<T>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "volume of shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Creates a volume filled with `value`
    pub fn filled(shape: [usize; 3], value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Value at channel `c`, row `y`, column `x`
    pub fn get(&self, c: usize, y: usize, x: usize) -> T {
        self.data[(c * self.shape[1] + y) * self.shape[2] + x]
    }

    /// One channel as a row-major plane
    pub fn plane(&self, c: usize) -> &[T] {
        let size = self.shape[1] * self.shape[2];
        &self.data[c * size..(c + 1) * size]
    }

    /// Stacks volumes along the channel axis. All parts must share height and width.
    pub fn concat(parts: &[&Volume<T>]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidArgument("cannot concatenate zero volumes".to_string()))?;
        let (height, width) = (first.height(), first.width());
        let mut channels = 0;
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            if part.height() != height || part.width() != width {
                return Err(Error::InvalidArgument(format!(
                    "spatial shape mismatch: {}x{} vs {}x{}",
                    height,
                    width,
                    part.height(),
                    part.width()
                )));
            }
            channels += part.channels();
            data.extend_from_slice(&part.data);
        }
        Ok(Self {
            shape: [channels, height, width],
            data,
        })
    }

    /// Splits into channels `[0, at)` and `[at, channels)`
    pub fn split_channels(self, at: usize) -> Result<(Volume<T>, Volume<T>)> {
        if at > self.shape[0] {
            return Err(Error::InvalidArgument(format!(
                "cannot split {} channels at {}",
                self.shape[0], at
            )));
        }
        let [channels, height, width] = self.shape;
        let mut head = self.data;
        let tail = head.split_off(at * height * width);
        Ok((
            Volume {
                shape: [at, height, width],
                data: head,
            },
            Volume {
                shape: [channels - at, height, width],
                data: tail,
            },
        ))
    }

    /// Element-wise conversion
    pub fn map<U, F>(&self, f: F) -> Volume<U>
    where
        F: Fn(T) -> U,
    {
        Volume {
            shape: self.shape,
            data: self.data.iter().copied().map(f).collect(),
        }
    }
}
