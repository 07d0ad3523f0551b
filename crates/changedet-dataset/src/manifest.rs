//! Scene sources for chipped datasets.
//!
//! A [`SceneProvider`] hands out whole co-registered scenes (pre image, post
//! image, change mask) by index. The chipped adapter never looks at files
//! directly, it only talks to a provider, so scenes can come from a manifest
//! on disk ([`ManifestProvider`]) or be built in memory ([`InMemoryProvider`]).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use changedet_core::{BandSet, ChipDatasetConfig, Error, Result, Split, Volume};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download;
use crate::loader::ImageLoader;

/// File name of the scene manifest inside a dataset root
pub const MANIFEST_FILE: &str = "manifest.json";

/// One scene as written in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneEntry {
    pub name: String,
    /// Band name -> pre-change raster, relative to the dataset root
    pub pre: BTreeMap<String, PathBuf>,
    /// Band name -> post-change raster, relative to the dataset root
    pub post: BTreeMap<String, PathBuf>,
    /// Change mask raster, relative to the dataset root
    pub mask: PathBuf,
}

impl SceneEntry {
    /// Orders the band files of this entry for `bands`
    pub fn resolve(&self, bands: BandSet) -> Result<Scene> {
        let pick = |files: &BTreeMap<String, PathBuf>, side: &str| -> Result<Vec<PathBuf>> {
            bands
                .band_names()
                .iter()
                .map(|band| {
                    files.get(*band).cloned().ok_or_else(|| {
                        Error::Dataset(format!(
                            "scene '{}' has no {} image for band {}",
                            self.name, side, band
                        ))
                    })
                })
                .collect()
        };

        Ok(Scene {
            name: self.name.clone(),
            pre: pick(&self.pre, "pre")?,
            post: pick(&self.post, "post")?,
            mask: self.mask.clone(),
        })
    }
}

/// Scene lists per split
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub train: Vec<SceneEntry>,
    #[serde(default)]
    pub test: Vec<SceneEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Dataset(format!("Failed to read manifest {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn scenes(&self, split: Split) -> &[SceneEntry] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

/// A scene with band files ordered for one band set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scene {
    pub name: String,
    pub pre: Vec<PathBuf>,
    pub post: Vec<PathBuf>,
    pub mask: PathBuf,
}

/// Decoded rasters of one scene
#[derive(Debug, Clone)]
pub struct SceneData {
    /// `[bands, H, W]`
    pub pre: Volume<f32>,
    /// `[bands, H, W]`
    pub post: Volume<f32>,
    /// `[1, H, W]` with values in {0, 1}
    pub mask: Volume<u8>,
}

impl SceneData {
    /// Bundles the rasters of a scene, checking that they line up
    pub fn new(pre: Volume<f32>, post: Volume<f32>, mask: Volume<u8>) -> Result<Self> {
        if pre.shape() != post.shape() {
            return Err(Error::Dataset(format!(
                "pre image {:?} and post image {:?} differ in shape",
                pre.shape(),
                post.shape()
            )));
        }
        if mask.channels() != 1 || mask.height() != pre.height() || mask.width() != pre.width() {
            return Err(Error::Dataset(format!(
                "mask {:?} does not match image {:?}",
                mask.shape(),
                pre.shape()
            )));
        }
        Ok(Self { pre, post, mask })
    }
}

/// Source of whole scenes, addressed by 0-based index
pub trait SceneProvider: Send + Sync {
    /// Band set every scene is decoded with
    fn bands(&self) -> BandSet;

    /// Number of scenes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scene_name(&self, index: usize) -> Result<String>;

    /// Decodes only the pre-change image of a scene
    fn load_pre_image(&self, index: usize) -> Result<Volume<f32>>;

    /// Decodes the full scene
    fn load_scene(&self, index: usize) -> Result<SceneData>;
}

/// Scenes listed in `<root>/manifest.json`
#[derive(Debug, Clone)]
pub struct ManifestProvider {
    loader: ImageLoader,
    bands: BandSet,
    split: Split,
    scenes: Vec<Scene>,
}

impl ManifestProvider {
    /// Opens the manifest for the configured split, downloading the dataset
    /// archive first when the manifest is missing and `download` is set
    pub fn open(config: &ChipDatasetConfig) -> Result<Self> {
        let manifest_path = config.root.join(MANIFEST_FILE);

        if !manifest_path.exists() {
            if !config.download {
                return Err(Error::NotFound(format!(
                    "Manifest not found: {} (set download = true to fetch the dataset)",
                    manifest_path.display()
                )));
            }
            let source = config.source.as_ref().ok_or_else(|| {
                Error::Config("download requested but no source archive configured".to_string())
            })?;
            download::fetch_and_extract(source, &config.root, config.checksum)?;
            if !manifest_path.exists() {
                return Err(Error::Dataset(format!(
                    "archive {} did not contain {}",
                    source.file_name, MANIFEST_FILE
                )));
            }
        }

        let manifest = Manifest::load(&manifest_path)?;
        Self::from_manifest(&config.root, &manifest, config.split, config.bands)
    }

    /// Builds a provider over one split of an already parsed manifest
    pub fn from_manifest(
        root: &Path,
        manifest: &Manifest,
        split: Split,
        bands: BandSet,
    ) -> Result<Self> {
        let scenes = manifest
            .scenes(split)
            .iter()
            .map(|entry| entry.resolve(bands))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Loaded {} {} scenes ({} bands) from {}",
            scenes.len(),
            split,
            bands,
            root.display()
        );

        Ok(Self {
            loader: ImageLoader::new(root),
            bands,
            split,
            scenes,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    fn scene(&self, index: usize) -> Result<&Scene> {
        self.scenes.get(index).ok_or_else(|| {
            Error::NotFound(format!(
                "scene {} of {} in {} split",
                index,
                self.scenes.len(),
                self.split
            ))
        })
    }
}

impl SceneProvider for ManifestProvider {
    fn bands(&self) -> BandSet {
        self.bands
    }

    fn len(&self) -> usize {
        self.scenes.len()
    }

    fn scene_name(&self, index: usize) -> Result<String> {
        Ok(self.scene(index)?.name.clone())
    }

    fn load_pre_image(&self, index: usize) -> Result<Volume<f32>> {
        let scene = self.scene(index)?;
        self.loader.load_bands(&scene.pre)
    }

    fn load_scene(&self, index: usize) -> Result<SceneData> {
        let scene = self.scene(index)?;
        debug!("Decoding scene {} ({})", index, scene.name);
        let pre = self.loader.load_bands(&scene.pre)?;
        let post = self.loader.load_bands(&scene.post)?;
        let mask = self.loader.load_mask(&scene.mask)?;
        SceneData::new(pre, post, mask)
    }
}

/// Scenes held in memory
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    bands: BandSet,
    scenes: Vec<(String, SceneData)>,
}

impl InMemoryProvider {
    pub fn new(bands: BandSet) -> Self {
        Self {
            bands,
            scenes: Vec::new(),
        }
    }

    /// Appends a scene; its images must carry one channel per band
    pub fn push(&mut self, name: impl Into<String>, scene: SceneData) -> Result<()> {
        if scene.pre.channels() != self.bands.channel_count() {
            return Err(Error::InvalidArgument(format!(
                "scene has {} channels, band set {} needs {}",
                scene.pre.channels(),
                self.bands,
                self.bands.channel_count()
            )));
        }
        self.scenes.push((name.into(), scene));
        Ok(())
    }

    pub fn with_scene(mut self, name: impl Into<String>, scene: SceneData) -> Result<Self> {
        self.push(name, scene)?;
        Ok(self)
    }

    fn scene(&self, index: usize) -> Result<&(String, SceneData)> {
        self.scenes
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("scene {} of {}", index, self.scenes.len())))
    }
}

impl SceneProvider for InMemoryProvider {
    fn bands(&self) -> BandSet {
        self.bands
    }

    fn len(&self) -> usize {
        self.scenes.len()
    }

    fn scene_name(&self, index: usize) -> Result<String> {
        Ok(self.scene(index)?.0.clone())
    }

    fn load_pre_image(&self, index: usize) -> Result<Volume<f32>> {
        Ok(self.scene(index)?.1.pre.clone())
    }

    fn load_scene(&self, index: usize) -> Result<SceneData> {
        Ok(self.scene(index)?.1.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use tempfile::TempDir;

    /// Writes 16-bit RGB bands and a striped mask for one scene under `root`
    pub(crate) fn write_scene(root: &Path, name: &str, size: u32) -> SceneEntry {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut pre = BTreeMap::new();
        let mut post = BTreeMap::new();
        for (i, band) in BandSet::Rgb.band_names().iter().enumerate() {
            for (side, files, offset) in [("pre", &mut pre, 0u16), ("post", &mut post, 500u16)] {
                let relative = PathBuf::from(name).join(format!("{side}_{band}.png"));
                let img = ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(
                    size,
                    size,
                    Luma([offset + 100 * i as u16]),
                );
                img.save(root.join(&relative)).unwrap();
                files.insert(band.to_string(), relative);
            }
        }
        let mask = PathBuf::from(name).join("cm.png");
        ImageBuffer::<Luma<u8>, Vec<u8>>::from_fn(size, size, |x, _| Luma([(x % 2) as u8 * 255]))
            .save(root.join(&mask))
            .unwrap();
        SceneEntry {
            name: name.to_string(),
            pre,
            post,
            mask,
        }
    }

    #[test]
    fn test_manifest_provider_loads_scene() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest {
            train: vec![write_scene(temp_dir.path(), "city_a", 8)],
            test: vec![],
        };
        manifest.save(&temp_dir.path().join(MANIFEST_FILE)).unwrap();

        let config = ChipDatasetConfig {
            root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let provider = ManifestProvider::open(&config).unwrap();
        assert_eq!(provider.len(), 1);
        assert_eq!(provider.scene_name(0).unwrap(), "city_a");

        let scene = provider.load_scene(0).unwrap();
        assert_eq!(scene.pre.shape(), [3, 8, 8]);
        assert_eq!(scene.pre.get(2, 0, 0), 200.0);
        assert_eq!(scene.post.get(0, 3, 3), 500.0);
        assert_eq!(scene.mask.get(0, 0, 1), 1);
        assert!(provider.load_scene(1).is_err());
    }

    #[test]
    fn test_missing_manifest_without_download() {
        let temp_dir = TempDir::new().unwrap();
        let config = ChipDatasetConfig {
            root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(matches!(
            ManifestProvider::open(&config),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_download_requires_source() {
        let temp_dir = TempDir::new().unwrap();
        let config = ChipDatasetConfig {
            root: temp_dir.path().to_path_buf(),
            download: true,
            ..Default::default()
        };
        assert!(matches!(
            ManifestProvider::open(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_entry_missing_band() {
        let entry = SceneEntry {
            name: "partial".to_string(),
            pre: BTreeMap::from([("B04".to_string(), PathBuf::from("a.tif"))]),
            post: BTreeMap::new(),
            mask: PathBuf::from("cm.png"),
        };
        assert!(matches!(entry.resolve(BandSet::Rgb), Err(Error::Dataset(_))));
    }

    #[test]
    fn test_manifest_json_layout() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"test": [{"name": "s", "pre": {"B04": "p.tif"}, "post": {"B04": "q.tif"}, "mask": "cm.png"}]}"#,
        )
        .unwrap();
        assert!(manifest.scenes(Split::Train).is_empty());
        assert_eq!(manifest.scenes(Split::Test)[0].name, "s");
    }

    #[test]
    fn test_in_memory_provider_checks_bands() {
        let scene = SceneData::new(
            Volume::filled([2, 4, 4], 0.0),
            Volume::filled([2, 4, 4], 0.0),
            Volume::filled([1, 4, 4], 0),
        )
        .unwrap();
        let mut provider = InMemoryProvider::new(BandSet::Rgb);
        assert!(provider.push("two-band", scene).is_err());
        assert!(provider.is_empty());
    }

    #[test]
    fn test_scene_data_shape_checks() {
        let result = SceneData::new(
            Volume::filled([3, 4, 4], 0.0),
            Volume::filled([3, 4, 5], 0.0),
            Volume::filled([1, 4, 4], 0),
        );
        assert!(result.is_err());
        let result = SceneData::new(
            Volume::filled([3, 4, 4], 0.0),
            Volume::filled([3, 4, 4], 0.0),
            Volume::filled([1, 2, 4], 0),
        );
        assert!(result.is_err());
    }
}
