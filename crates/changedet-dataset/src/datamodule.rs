//! Data module orchestrating datasets and dataloaders per stage.
//!
//! Call order:
//!
//! 1. [`ChangeDetectionDataModule::new`] with a validated [`DataModuleConfig`]
//! 2. [`ChangeDetectionDataModule::configure`] for any stage, any number of times
//! 3. [`ChangeDetectionDataModule::setup`] (or [`ChangeDetectionDataModule::build`]) per stage
//! 4. dataset and dataloader accessors
//!
//! `fit` and `validate` read the train split and partition its chips into a
//! training and a validation subset. `test` and `predict` read the test split.
//! Transforms are captured when `setup` runs; configuring a stage afterwards
//! only takes effect on the next `setup`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use changedet_core::{DataModuleConfig, Error, Result, Split, Stage};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::batcher::{ChipBatch, ChipBatcher};
use crate::chipped::{Chip, ChippedDataset};
use crate::manifest::{ManifestProvider, SceneProvider};
use crate::normalization::{normalization_values, normalize_batch, ChannelStatistics};
use crate::transforms::SharedTransform;

/// Opens the scene provider for a split
pub type ProviderFactory = Arc<dyn Fn(Split) -> Result<Arc<dyn SceneProvider>> + Send + Sync>;

/// A view of selected chips of a dataset
#[derive(Clone, Debug)]
pub struct ChipSubset {
    dataset: ChippedDataset,
    indices: Arc<Vec<usize>>,
}

impl ChipSubset {
    pub fn new(dataset: ChippedDataset, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            indices: Arc::new(indices),
        }
    }

    /// Chip indices of the underlying dataset, in subset order
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn dataset(&self) -> &ChippedDataset {
        &self.dataset
    }

    pub fn try_get(&self, index: usize) -> Result<Chip> {
        let inner = *self.indices.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.indices.len(),
        })?;
        self.dataset.try_get(inner)
    }
}

impl Dataset<Chip> for ChipSubset {
    fn get(&self, index: usize) -> Option<Chip> {
        let inner = *self.indices.get(index)?;
        self.dataset.get(inner)
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Randomly partitions `0..len` into `(train, val)` with
/// `round(len * val_pct)` validation indices
pub fn split_indices(len: usize, val_pct: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let val_length = ((len as f64) * val_pct).round() as usize;
    let train_length = len - val_length.min(len);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rng);

    let val = indices.split_off(train_length);
    (indices, val)
}

/// Stage-aware dataset orchestration for chipped change detection
pub struct ChangeDetectionDataModule {
    config: DataModuleConfig,
    provider_factory: ProviderFactory,
    transforms: HashMap<Stage, SharedTransform>,
    batch_statistics: ChannelStatistics,
    train_dataset: Option<ChipSubset>,
    val_dataset: Option<ChipSubset>,
    test_dataset: Option<ChippedDataset>,
    predict_dataset: Option<ChippedDataset>,
}

impl ChangeDetectionDataModule {
    /// Reads scenes from the manifest under `config.dataset.root`
    pub fn new(config: DataModuleConfig) -> Result<Self> {
        let dataset_config = config.dataset.clone();
        let factory: ProviderFactory = Arc::new(move |split| {
            let provider = ManifestProvider::open(&dataset_config.with_split(split))?;
            Ok(Arc::new(provider) as Arc<dyn SceneProvider>)
        });
        Self::with_provider_factory(config, factory)
    }

    /// Reads scenes from providers built by `factory`
    pub fn with_provider_factory(config: DataModuleConfig, factory: ProviderFactory) -> Result<Self> {
        config.validate()?;
        let batch_statistics = normalization_values(config.dataset.bands).doubled();
        Ok(Self {
            config,
            provider_factory: factory,
            transforms: HashMap::new(),
            batch_statistics,
            train_dataset: None,
            val_dataset: None,
            test_dataset: None,
            predict_dataset: None,
        })
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    /// Sets (or clears) the per-chip transform of a stage
    pub fn configure(&mut self, stage: Stage, transform: Option<SharedTransform>) {
        match transform {
            Some(transform) => {
                self.transforms.insert(stage, transform);
            }
            None => {
                self.transforms.remove(&stage);
            }
        }
    }

    pub fn transform(&self, stage: Stage) -> Option<&SharedTransform> {
        self.transforms.get(&stage)
    }

    fn open(&self, split: Split) -> Result<ChippedDataset> {
        let provider = (self.provider_factory)(split)?;
        ChippedDataset::new(provider, self.config.dataset.geometry()?)
    }

    fn with_stage_transform(&self, mut dataset: ChippedDataset, stage: Stage) -> ChippedDataset {
        dataset.set_transform(self.transforms.get(&stage).cloned());
        dataset
    }

    /// Builds the datasets for `stage`, replacing any built before
    pub fn setup(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Fit | Stage::Validate => {
                let dataset = self.open(Split::Train)?;
                let (train, val) =
                    split_indices(dataset.len(), self.config.val_split_pct, self.config.seed);
                info!(
                    "Split {} training chips into {} train / {} validation (seed {})",
                    dataset.len(),
                    train.len(),
                    val.len(),
                    self.config.seed
                );
                let train_base = self.with_stage_transform(dataset.clone(), Stage::Fit);
                let val_base = self.with_stage_transform(dataset, Stage::Validate);
                self.train_dataset = Some(ChipSubset::new(train_base, train));
                self.val_dataset = Some(ChipSubset::new(val_base, val));
            }
            Stage::Test => {
                let dataset = self.open(Split::Test)?;
                info!("Test split: {} chips", dataset.len());
                self.test_dataset = Some(self.with_stage_transform(dataset, Stage::Test));
            }
            Stage::Predict => {
                let dataset = self.open(Split::Test)?;
                info!("Predict split: {} chips", dataset.len());
                self.predict_dataset = Some(self.with_stage_transform(dataset, Stage::Predict));
            }
        }
        Ok(())
    }

    /// Runs [`Self::setup`] and returns the dataset `stage` iterates over
    pub fn build(&mut self, stage: Stage) -> Result<Arc<dyn Dataset<Chip>>> {
        self.setup(stage)?;
        self.stage_dataset(stage)
    }

    fn stage_dataset(&self, stage: Stage) -> Result<Arc<dyn Dataset<Chip>>> {
        let dataset: Option<Arc<dyn Dataset<Chip>>> = match stage {
            Stage::Fit => self
                .train_dataset
                .clone()
                .map(|d| Arc::new(d) as Arc<dyn Dataset<Chip>>),
            Stage::Validate => self
                .val_dataset
                .clone()
                .map(|d| Arc::new(d) as Arc<dyn Dataset<Chip>>),
            Stage::Test => self
                .test_dataset
                .clone()
                .map(|d| Arc::new(d) as Arc<dyn Dataset<Chip>>),
            Stage::Predict => self
                .predict_dataset
                .clone()
                .map(|d| Arc::new(d) as Arc<dyn Dataset<Chip>>),
        };
        dataset.ok_or_else(|| Error::Dataset(format!("call setup({stage}) first")))
    }

    pub fn train_dataset(&self) -> Option<&ChipSubset> {
        self.train_dataset.as_ref()
    }

    pub fn val_dataset(&self) -> Option<&ChipSubset> {
        self.val_dataset.as_ref()
    }

    pub fn test_dataset(&self) -> Option<&ChippedDataset> {
        self.test_dataset.as_ref()
    }

    pub fn predict_dataset(&self) -> Option<&ChippedDataset> {
        self.predict_dataset.as_ref()
    }

    fn dataloader<B: Backend>(
        &self,
        stage: Stage,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChipBatch<B>>>> {
        let dataset = self.stage_dataset(stage)?;
        let mut builder = DataLoaderBuilder::new(ChipBatcher::<B>::new(device))
            .batch_size(self.config.batch_size);
        if stage == Stage::Fit {
            builder = builder.shuffle(self.config.seed);
        }
        if self.config.num_workers > 0 {
            builder = builder.num_workers(self.config.num_workers);
        }
        Ok(builder.build(SharedDataset(dataset)))
    }

    pub fn train_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChipBatch<B>>>> {
        self.dataloader(Stage::Fit, device)
    }

    pub fn val_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChipBatch<B>>>> {
        self.dataloader(Stage::Validate, device)
    }

    pub fn test_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChipBatch<B>>>> {
        self.dataloader(Stage::Test, device)
    }

    pub fn predict_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChipBatch<B>>>> {
        self.dataloader(Stage::Predict, device)
    }

    /// Mean/std applied to batches once they reach the device
    pub fn batch_statistics(&self) -> &ChannelStatistics {
        &self.batch_statistics
    }

    /// Normalizes the images of a device batch
    pub fn on_after_batch_transfer<B: Backend>(&self, batch: ChipBatch<B>) -> ChipBatch<B> {
        ChipBatch {
            images: normalize_batch(batch.images, &self.batch_statistics),
            masks: batch.masks,
        }
    }
}

impl fmt::Debug for ChangeDetectionDataModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetectionDataModule")
            .field("config", &self.config)
            .field("configured_stages", &self.transforms.keys().collect::<Vec<_>>())
            .field("train", &self.train_dataset.as_ref().map(|d| d.len()))
            .field("val", &self.val_dataset.as_ref().map(|d| d.len()))
            .field("test", &self.test_dataset.as_ref().map(|d| d.len()))
            .field("predict", &self.predict_dataset.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Owned handle to a type-erased dataset, as the dataloader builder needs a sized type
struct SharedDataset(Arc<dyn Dataset<Chip>>);

impl Dataset<Chip> for SharedDataset {
    fn get(&self, index: usize) -> Option<Chip> {
        self.0.get(index)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipped::tests::provider;
    use burn_ndarray::NdArray;
    use changedet_core::TileExtent;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn module(val_split_pct: f64) -> ChangeDetectionDataModule {
        let mut config = DataModuleConfig {
            batch_size: 4,
            val_split_pct,
            ..Default::default()
        };
        config.dataset.tile_size = TileExtent::Square(8);
        config.dataset.stride = TileExtent::Square(8);
        let factory: ProviderFactory = Arc::new(|split| {
            Ok(match split {
                // 4 + 16 chips
                Split::Train => provider(&[(16, 16), (32, 32)]),
                // 4 chips
                Split::Test => provider(&[(16, 16)]),
            })
        });
        ChangeDetectionDataModule::with_provider_factory(config, factory).unwrap()
    }

    #[test]
    fn test_split_indices_partition() {
        let (train, val) = split_indices(101, 0.2, 7);
        assert_eq!(val.len(), 20);
        assert_eq!(train.len(), 81);

        let all: HashSet<usize> = train.iter().chain(val.iter()).copied().collect();
        assert_eq!(all.len(), 101);
        assert!(all.iter().all(|i| *i < 101));
    }

    #[test]
    fn test_split_indices_deterministic() {
        assert_eq!(split_indices(50, 0.3, 1), split_indices(50, 0.3, 1));
        assert_ne!(split_indices(50, 0.3, 1).1, split_indices(50, 0.3, 2).1);
        let (train, val) = split_indices(10, 0.0, 0);
        assert_eq!(train.len(), 10);
        assert!(val.is_empty());
    }

    #[test]
    fn test_invalid_val_split() {
        let mut config = DataModuleConfig::default();
        config.val_split_pct = 1.5;
        let factory: ProviderFactory = Arc::new(|_| Ok(provider(&[])));
        assert!(ChangeDetectionDataModule::with_provider_factory(config, factory).is_err());
    }

    #[test]
    fn test_setup_fit_uses_stage_transforms() {
        let mut dm = module(0.25);
        dm.configure(
            Stage::Fit,
            Some(Arc::new(|mut chip: Chip| -> Result<Chip> {
                chip.image = chip.image.map(|_| 1.0);
                Ok(chip)
            })),
        );
        dm.configure(
            Stage::Validate,
            Some(Arc::new(|mut chip: Chip| -> Result<Chip> {
                chip.image = chip.image.map(|_| 2.0);
                Ok(chip)
            })),
        );
        dm.setup(Stage::Fit).unwrap();

        let train = dm.train_dataset().unwrap();
        let val = dm.val_dataset().unwrap();
        assert_eq!(train.len(), 15);
        assert_eq!(val.len(), 5);
        assert_eq!(train.try_get(0).unwrap().image.get(0, 0, 0), 1.0);
        assert_eq!(val.try_get(0).unwrap().image.get(0, 0, 0), 2.0);
        assert!(train.try_get(15).is_err());

        let seen: HashSet<usize> = train.indices().iter().chain(val.indices()).copied().collect();
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_setup_test_and_predict() {
        let mut dm = module(0.2);
        assert!(dm.test_dataset().is_none());
        let test = dm.build(Stage::Test).unwrap();
        assert_eq!(test.len(), 4);

        dm.setup(Stage::Predict).unwrap();
        assert_eq!(dm.predict_dataset().unwrap().len(), 4);
        assert!(dm.train_dataset().is_none());
    }

    #[test]
    fn test_dataloader_requires_setup() {
        let dm = module(0.2);
        assert!(dm.test_dataloader::<TestBackend>(Default::default()).is_err());
    }

    #[test]
    fn test_test_dataloader_batches() {
        let mut dm = module(0.2);
        dm.setup(Stage::Test).unwrap();
        let loader = dm.test_dataloader::<TestBackend>(Default::default()).unwrap();

        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].images.dims(), [4, 6, 8, 8]);
        assert_eq!(batches[0].masks.dims(), [4, 1, 8, 8]);

        let normalized = dm.on_after_batch_transfer(batches[0].clone());
        assert_eq!(normalized.images.dims(), [4, 6, 8, 8]);
    }
}
