//! Chipped change-detection datasets.
//!
//! Scenes of co-registered pre/post imagery are cut into fixed-size chips
//! that burn's dataloaders can batch:
//!
//! - [`manifest`]: scene providers (manifest on disk, in memory)
//! - [`tiler`]: regular tile grids over channel-first volumes
//! - [`chipped`]: the chip index and lazily materialized chips
//! - [`normalization`], [`transforms`], [`statistics`]: band statistics and per-chip transforms
//! - [`datamodule`]: per-stage datasets, train/validation split and dataloaders
//! - [`download`]: archive download, SHA-256 verification and extraction

pub mod batcher;
pub mod chipped;
pub mod datamodule;
pub mod download;
pub mod loader;
pub mod manifest;
pub mod normalization;
pub mod statistics;
pub mod tiler;
pub mod transforms;

pub use batcher::{split_images, ChipBatch, ChipBatcher};
pub use chipped::{Chip, ChipIndex, ChippedDataset};
pub use datamodule::{split_indices, ChangeDetectionDataModule, ChipSubset, ProviderFactory};
pub use loader::ImageLoader;
pub use manifest::{
    InMemoryProvider, Manifest, ManifestProvider, Scene, SceneData, SceneEntry, SceneProvider,
    MANIFEST_FILE,
};
pub use normalization::{
    normalization_values, normalize_batch, normalize_transform, scale_transform,
    ChannelStatistics, REFLECTANCE_SCALE,
};
pub use statistics::compute_mean_std;
pub use tiler::Tiler;
pub use transforms::{ChipTransform, Compose, NormalizeImage, ScaleImage, SharedTransform};
