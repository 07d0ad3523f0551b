//! Pretrained weight resolution and loading.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use changedet_core::{Error, Result};
use changedet_dataset::download;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::ModelFamily;

/// Directory holding weights that ship with the repository
pub const FINAL_WEIGHTS_DIR: &str = "final_weights";

const DDPMCD_OMS2CD_URL: &str = "https://drive.google.com/uc?export=download&id=1CeQJQKjF8oMSUQs7P_mSVHwzthB9BSuy&confirm=t";
const DDPMCD_OMS2CD_SHA256: &str =
    "ecf10f6ae54aa7e19814f3797de025d7fbfd3b957547666f8111094b41e71a18";

/// Where a weight file lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WeightSource {
    /// Already on disk
    Local { path: PathBuf },
    /// Downloaded into `cache_dir` on first use and verified against `sha256`
    Remote {
        url: String,
        sha256: String,
        cache_dir: PathBuf,
        file_name: String,
    },
}

/// Weights of one model family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PretrainedWeights {
    pub family: ModelFamily,
    pub source: WeightSource,
}

impl PretrainedWeights {
    pub fn local(family: ModelFamily, path: impl Into<PathBuf>) -> Self {
        Self {
            family,
            source: WeightSource::Local { path: path.into() },
        }
    }

    /// TinyCD trained on OMS2CD
    pub fn tinycd_oms2cd() -> Self {
        Self::local(
            ModelFamily::TinyCd,
            Path::new(FINAL_WEIGHTS_DIR).join("tinycd_oms2cd.mpk"),
        )
    }

    /// LSNet trained on OMS2CD
    pub fn lsnet_oms2cd() -> Self {
        Self::local(
            ModelFamily::LsNet,
            Path::new(FINAL_WEIGHTS_DIR).join("lsnet_oms2cd.mpk"),
        )
    }

    /// DDPM-CD trained on OMS2CD, fetched into `cache_dir`
    pub fn ddpmcd_oms2cd(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            family: ModelFamily::DdpmCd,
            source: WeightSource::Remote {
                url: DDPMCD_OMS2CD_URL.to_string(),
                sha256: DDPMCD_OMS2CD_SHA256.to_string(),
                cache_dir: cache_dir.into(),
                file_name: "ddpmcd_oms2cd.mpk".to_string(),
            },
        }
    }

    /// Local path of the weight file, downloading remote weights when missing.
    /// A cached remote file with the wrong digest is fetched again.
    pub fn resolve(&self) -> Result<PathBuf> {
        match &self.source {
            WeightSource::Local { path } => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(Error::NotFound(format!(
                        "{} weights not found at {}",
                        self.family,
                        path.display()
                    )))
                }
            }
            WeightSource::Remote {
                url,
                sha256,
                cache_dir,
                file_name,
            } => {
                let path = cache_dir.join(file_name);
                if !path.exists() {
                    info!("Fetching {} weights into {}", self.family, cache_dir.display());
                }
                download::fetch_file(url, &path, Some(sha256))?;
                Ok(path)
            }
        }
    }
}

/// Loads a burn record saved with the named MessagePack recorder into `model`
pub fn load_weights<B, M>(model: M, path: &Path, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    // The recorder appends the extension itself
    let path = if path.extension().is_some_and(|ext| ext == "mpk") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };
    info!("Loading weights from {}.mpk", path.display());
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.clone(), &recorder, device)
        .map_err(|e| Error::Model(format!("Failed to load {}: {:?}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_presets() {
        let tinycd = PretrainedWeights::tinycd_oms2cd();
        assert_eq!(tinycd.family, ModelFamily::TinyCd);
        assert_eq!(
            tinycd.source,
            WeightSource::Local {
                path: PathBuf::from("final_weights/tinycd_oms2cd.mpk")
            }
        );

        let ddpm = PretrainedWeights::ddpmcd_oms2cd("cache");
        match ddpm.source {
            WeightSource::Remote { sha256, cache_dir, .. } => {
                assert_eq!(sha256, DDPMCD_OMS2CD_SHA256);
                assert_eq!(cache_dir, PathBuf::from("cache"));
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_resolve_missing_local() {
        let weights = PretrainedWeights::local(ModelFamily::LsNet, "/nonexistent/lsnet.mpk");
        assert!(matches!(weights.resolve(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_resolve_cached_remote_refetches_on_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("w.mpk"), "hello").unwrap();
        let mut weights = PretrainedWeights {
            family: ModelFamily::DdpmCd,
            source: WeightSource::Remote {
                url: "http://127.0.0.1:9/unused".to_string(),
                sha256: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                    .to_string(),
                cache_dir: temp_dir.path().to_path_buf(),
                file_name: "w.mpk".to_string(),
            },
        };
        assert_eq!(weights.resolve().unwrap(), temp_dir.path().join("w.mpk"));

        // a stale cache entry is dropped before the (unreachable) refetch
        if let WeightSource::Remote { sha256, .. } = &mut weights.source {
            *sha256 = "00".to_string();
        }
        assert!(matches!(weights.resolve(), Err(Error::Download(_))));
        assert!(!temp_dir.path().join("w.mpk").exists());
    }

    #[test]
    fn test_load_weights_roundtrip() {
        let device = Default::default();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("linear");

        let saved: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        saved
            .clone()
            .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let fresh: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let loaded = load_weights(fresh, &temp_dir.path().join("linear.mpk"), &device).unwrap();
        assert_eq!(
            loaded.weight.val().into_data().to_vec::<f32>().unwrap(),
            saved.weight.val().into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_weight_source_json() {
        let json = serde_json::to_string(&PretrainedWeights::lsnet_oms2cd()).unwrap();
        assert!(json.contains("\"kind\":\"local\""));
        assert!(json.contains("lsnet"));
    }
}
