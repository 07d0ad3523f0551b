//! Chipped change-detection dataset.
//!
//! Every scene is cut into fixed-size tiles ("chips"). The set of chips is
//! flattened into one index space: scene 0's chips come first, then scene 1's,
//! and so on. The index is computed once when the dataset is built, from the
//! pre-change image of each scene; chip contents are decoded lazily on every
//! access and never cached.

use std::fmt;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use changedet_core::{ChipDatasetConfig, Error, Result, TileGeometry, Volume};
use tracing::{debug, info, warn};

use crate::manifest::{ManifestProvider, SceneData, SceneProvider};
use crate::tiler::Tiler;
use crate::transforms::SharedTransform;

/// One training sample
#[derive(Debug, Clone, PartialEq)]
pub struct Chip {
    /// `[2 * bands, H, W]`: pre-change bands followed by post-change bands
    pub image: Volume<f32>,
    /// `[1, H, W]` change labels
    pub mask: Volume<i64>,
}

/// Flat mapping from chip index to `(scene, tile within scene)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIndex {
    geometry: TileGeometry,
    entries: Vec<(usize, usize)>,
    /// Shape of the pre image stacked with itself, per scene
    shapes: Vec<[usize; 3]>,
}

impl ChipIndex {
    /// Computes the chip index for every scene of `provider`
    pub fn build(provider: &dyn SceneProvider, geometry: TileGeometry) -> Result<Self> {
        let mut entries = Vec::new();
        let mut shapes = Vec::with_capacity(provider.len());

        for scene in 0..provider.len() {
            let pre = provider.load_pre_image(scene)?;
            let shape = [2 * pre.channels(), pre.height(), pre.width()];
            let tiler = Tiler::full_depth(shape, geometry.tile, geometry.overlap)?;
            let count = tiler.len();

            debug!(
                "Scene {} {:?}: {} chips ({:?} mosaic)",
                scene,
                shape,
                count,
                tiler.mosaic_shape()
            );

            entries.extend((0..count).map(|local| (scene, local)));
            shapes.push(shape);
        }

        info!(
            "Indexed {} chips over {} scenes (tile {:?}, overlap {:?})",
            entries.len(),
            shapes.len(),
            geometry.tile,
            geometry.overlap
        );

        Ok(Self {
            geometry,
            entries,
            shapes,
        })
    }

    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(scene, local tile)` of a chip
    pub fn locate(&self, index: usize) -> Result<(usize, usize)> {
        self.entries
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })
    }

    pub fn entries(&self) -> &[(usize, usize)] {
        &self.entries
    }

    /// Recorded `(2 * bands, H, W)` shape of a scene
    pub fn scene_shape(&self, scene: usize) -> Option<[usize; 3]> {
        self.shapes.get(scene).copied()
    }

    pub fn num_scenes(&self) -> usize {
        self.shapes.len()
    }

    /// Number of chips cut from `scene`
    pub fn scene_chip_count(&self, scene: usize) -> usize {
        self.entries.iter().filter(|(s, _)| *s == scene).count()
    }
}

/// Dataset of chips over the scenes of a [`SceneProvider`]
#[derive(Clone)]
pub struct ChippedDataset {
    provider: Arc<dyn SceneProvider>,
    index: Arc<ChipIndex>,
    transform: Option<SharedTransform>,
}

impl ChippedDataset {
    /// Builds the chip index over `provider`
    pub fn new(provider: Arc<dyn SceneProvider>, geometry: TileGeometry) -> Result<Self> {
        let index = ChipIndex::build(provider.as_ref(), geometry)?;
        Ok(Self {
            provider,
            index: Arc::new(index),
            transform: None,
        })
    }

    /// Opens the manifest described by `config` and indexes its scenes
    pub fn from_config(config: &ChipDatasetConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        let provider = ManifestProvider::open(config)?;
        Self::new(Arc::new(provider), geometry)
    }

    pub fn with_transform(mut self, transform: SharedTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Replaces the transform applied to every chip
    pub fn set_transform(&mut self, transform: Option<SharedTransform>) {
        self.transform = transform;
    }

    pub fn index(&self) -> &ChipIndex {
        &self.index
    }

    pub fn provider(&self) -> &Arc<dyn SceneProvider> {
        &self.provider
    }

    /// Materializes chip `index`
    pub fn try_get(&self, index: usize) -> Result<Chip> {
        let (scene, local) = self.index.locate(index)?;
        let [channels, height, width] = self.index.scene_shape(scene).ok_or(
            Error::IndexOutOfRange {
                index: scene,
                len: self.index.num_scenes(),
            },
        )?;

        let data = self.provider.load_scene(scene)?;
        let stacked = stack_scene(&data)?;
        let geometry = self.index.geometry();
        let tiler = Tiler::full_depth(
            [channels + 1, height, width],
            geometry.tile,
            geometry.overlap,
        )?;
        let tile = tiler.get_tile(&stacked, local)?;

        let chip = split_tile(tile, channels)?;
        match &self.transform {
            Some(transform) => transform.apply(chip),
            None => Ok(chip),
        }
    }

    /// Cuts every chip of `scene` in one pass, without transforms
    pub fn scene_chips(&self, scene: usize) -> Result<Vec<Chip>> {
        let data = self.provider.load_scene(scene)?;
        let stacked = stack_scene(&data)?;
        let geometry = self.index.geometry();
        let tiler = Tiler::full_depth(stacked.shape(), geometry.tile, geometry.overlap)?;
        let channels = stacked.channels() - 1;
        tiler
            .tiles(&stacked)
            .map(|tile| split_tile(tile?, channels))
            .collect()
    }
}

/// Pre, post and mask stacked along channels
fn stack_scene(data: &SceneData) -> Result<Volume<f32>> {
    let mask = data.mask.map(f32::from);
    Volume::concat(&[&data.pre, &data.post, &mask])
}

fn split_tile(tile: Volume<f32>, channels: usize) -> Result<Chip> {
    let (image, mask) = tile.split_channels(channels)?;
    Ok(Chip {
        image,
        mask: mask.map(|v| v as i64),
    })
}

impl fmt::Debug for ChippedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChippedDataset")
            .field("bands", &self.provider.bands())
            .field("scenes", &self.index.num_scenes())
            .field("chips", &self.index.len())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl Dataset<Chip> for ChippedDataset {
    fn get(&self, index: usize) -> Option<Chip> {
        match self.try_get(index) {
            Ok(chip) => Some(chip),
            Err(e) => {
                warn!("Failed to load chip {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
