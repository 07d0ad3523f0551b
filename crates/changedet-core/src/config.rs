//! Configuration structures for chip datasets, the data module and evaluation.

use crate::error::{Error, Result};
use crate::types::{BandSet, Split};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A spatial extent given either as one integer (both axes) or as `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TileExtent {
    /// Same size along both spatial axes
    Square(usize),
    /// Explicit `[height, width]`; must hold exactly two values
    Pair(Vec<usize>),
}

impl TileExtent {
    /// Resolves to `(height, width)`, rejecting pairs of the wrong length
    pub fn resolve(&self, name: &str) -> Result<(usize, usize)> {
        match self {
            TileExtent::Square(size) => Ok((*size, *size)),
            TileExtent::Pair(values) => match values.as_slice() {
                [h, w] => Ok((*h, *w)),
                other => Err(Error::Config(format!(
                    "{name} must have exactly 2 values, got {}",
                    other.len()
                ))),
            },
        }
    }
}

impl From<usize> for TileExtent {
    fn from(size: usize) -> Self {
        TileExtent::Square(size)
    }
}

impl From<(usize, usize)> for TileExtent {
    fn from((h, w): (usize, usize)) -> Self {
        TileExtent::Pair(vec![h, w])
    }
}

/// Tile extent and per-axis overlap derived from tile size and stride
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Tile `(height, width)`
    pub tile: (usize, usize),
    /// Overlap `(height, width)` between neighbouring tiles
    pub overlap: (usize, usize),
}

impl TileGeometry {
    /// Overlap is `max(tile - stride, 0)` along each axis
    pub fn from_stride(tile: (usize, usize), stride: (usize, usize)) -> Result<Self> {
        if tile.0 == 0 || tile.1 == 0 {
            return Err(Error::Config(format!(
                "tile_size must be positive, got {:?}",
                tile
            )));
        }
        Ok(Self {
            tile,
            overlap: (tile.0.saturating_sub(stride.0), tile.1.saturating_sub(stride.1)),
        })
    }
}

/// Remote dataset archive with its known-good digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteArchive {
    /// Download URL
    pub url: String,
    /// Lowercase hex SHA-256 of the archive
    pub sha256: String,
    /// Archive file name inside the output directory
    pub file_name: String,
}

/// Configuration for a chipped change-detection dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChipDatasetConfig {
    /// Dataset root containing `manifest.json`
    pub root: PathBuf,
    /// Split to read
    pub split: Split,
    /// Band selection
    pub bands: BandSet,
    /// Fetch `source` when the manifest is missing
    pub download: bool,
    /// Verify the archive digest before extracting
    pub checksum: bool,
    /// Step between tile origins
    pub stride: TileExtent,
    /// Tile extent
    pub tile_size: TileExtent,
    /// Archive used when `download` is set
    pub source: Option<RemoteArchive>,
}

impl Default for ChipDatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            split: Split::Train,
            bands: BandSet::Rgb,
            download: false,
            checksum: false,
            stride: TileExtent::Square(128),
            tile_size: TileExtent::Square(256),
            source: None,
        }
    }
}

impl ChipDatasetConfig {
    /// Resolves tile size and stride into a validated geometry
    pub fn geometry(&self) -> Result<TileGeometry> {
        let tile = self.tile_size.resolve("tile_size")?;
        let stride = self.stride.resolve("stride")?;
        TileGeometry::from_stride(tile, stride)
    }

    /// Same configuration pointed at another split
    pub fn with_split(&self, split: Split) -> Self {
        Self {
            split,
            ..self.clone()
        }
    }
}

/// Data module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModuleConfig {
    /// Mini-batch size
    pub batch_size: usize,
    /// Fraction of training chips held out for validation, in `[0, 1)`
    pub val_split_pct: f64,
    /// Worker threads for the dataloader
    pub num_workers: usize,
    /// Seed for the train/validation split and shuffling
    pub seed: u64,
    /// Dataset parameters shared by all stages
    pub dataset: ChipDatasetConfig,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            val_split_pct: 0.2,
            num_workers: 0,
            seed: 0,
            dataset: ChipDatasetConfig::default(),
        }
    }
}

impl DataModuleConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.val_split_pct) {
            return Err(Error::Config(format!(
                "val_split_pct must be in [0, 1), got {}",
                self.val_split_pct
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        self.dataset.geometry().map(|_| ())
    }
}

/// Evaluation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Probability above which a pixel counts as changed
    pub threshold: f32,
    /// Number of evenly spaced PR-curve thresholds; `None` computes the exact curve
    pub pr_thresholds: Option<usize>,
    /// Band set used for input normalization
    pub bands: BandSet,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            pr_thresholds: Some(50),
            bands: BandSet::Rgb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_extent_resolve() {
        assert_eq!(TileExtent::Square(64).resolve("t").unwrap(), (64, 64));
        assert_eq!(TileExtent::from((32, 48)).resolve("t").unwrap(), (32, 48));
        assert!(TileExtent::Pair(vec![1, 2, 3]).resolve("t").is_err());
        assert!(TileExtent::Pair(vec![1]).resolve("t").is_err());
    }

    #[test]
    fn test_geometry_overlap_clamped() {
        let geometry = TileGeometry::from_stride((256, 256), (128, 300)).unwrap();
        assert_eq!(geometry.overlap, (128, 0));
    }

    #[test]
    fn test_dataset_config_from_toml() {
        let config: ChipDatasetConfig = toml::from_str(
            r#"
            root = "/data/oms2cd"
            split = "test"
            bands = "all"
            stride = [64, 32]
            tile_size = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.split, Split::Test);
        assert_eq!(config.bands, BandSet::All);
        let geometry = config.geometry().unwrap();
        assert_eq!(geometry.tile, (128, 128));
        assert_eq!(geometry.overlap, (64, 96));
    }

    #[test]
    fn test_data_module_validation() {
        let mut config = DataModuleConfig::default();
        assert!(config.validate().is_ok());
        config.val_split_pct = 1.0;
        assert!(config.validate().is_err());
        config.val_split_pct = 0.1;
        config.dataset.tile_size = TileExtent::Pair(vec![128]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_evaluation_config() {
        let config = EvaluationConfig::default();
        assert_eq!(config.threshold, 0.3);
        assert_eq!(config.pr_thresholds, Some(50));
    }
}
