//! Change-detection model interface and output conventions.
//!
//! Models from different families disagree on what their forward pass
//! returns. Some emit one sigmoid probability map, others emit two logits per
//! pixel. [`OutputConvention`] turns either form into a `[batch, H, W]` map of
//! change probabilities.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::activation;
use changedet_core::{Error, Result};
use changedet_dataset::split_images;
use serde::{Deserialize, Serialize};

/// Known model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// TinyCD: single-channel sigmoid output
    TinyCd,
    /// LSNet: two-class logits
    LsNet,
    /// DDPM-CD: two-class logits
    DdpmCd,
    /// Parameter-free spectral difference baseline
    Difference,
}

impl ModelFamily {
    pub fn output_convention(&self) -> OutputConvention {
        match self {
            ModelFamily::TinyCd | ModelFamily::Difference => OutputConvention::Probability,
            ModelFamily::LsNet | ModelFamily::DdpmCd => OutputConvention::SoftmaxClass { class: 1 },
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::TinyCd => write!(f, "tinycd"),
            ModelFamily::LsNet => write!(f, "lsnet"),
            ModelFamily::DdpmCd => write!(f, "ddpmcd"),
            ModelFamily::Difference => write!(f, "difference"),
        }
    }
}

impl FromStr for ModelFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "tinycd" => Ok(ModelFamily::TinyCd),
            "lsnet" => Ok(ModelFamily::LsNet),
            "ddpmcd" => Ok(ModelFamily::DdpmCd),
            "difference" => Ok(ModelFamily::Difference),
            other => Err(Error::InvalidArgument(format!("unknown model family '{other}'"))),
        }
    }
}

/// How raw model output maps to change probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputConvention {
    /// Output is `[B, 1, H, W]` and already a probability
    Probability,
    /// Output is `[B, K, H, W]` logits; take softmax channel `class`
    SoftmaxClass { class: usize },
}

impl OutputConvention {
    /// Extracts `[B, H, W]` change probabilities from raw output
    pub fn probabilities<B: Backend>(&self, output: Tensor<B, 4>) -> Result<Tensor<B, 3>> {
        let [batch, channels, height, width] = output.dims();
        match *self {
            OutputConvention::Probability => {
                if channels != 1 {
                    return Err(Error::Model(format!(
                        "expected a single probability channel, got {channels}"
                    )));
                }
                Ok(output.squeeze::<3>(1))
            }
            OutputConvention::SoftmaxClass { class } => {
                if class >= channels {
                    return Err(Error::Model(format!(
                        "class {class} out of range for {channels} output channels"
                    )));
                }
                Ok(activation::softmax(output, 1)
                    .slice([0..batch, class..class + 1, 0..height, 0..width])
                    .squeeze::<3>(1))
            }
        }
    }
}

/// A model mapping stacked pre/post images to a change map
pub trait ChangeDetector<B: Backend> {
    fn family(&self) -> ModelFamily;

    /// Raw output for normalized `[B, 2 * bands, H, W]` images
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    fn output_convention(&self) -> OutputConvention {
        self.family().output_convention()
    }

    /// `[B, H, W]` change probabilities for normalized images
    fn predict(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 3>> {
        self.output_convention().probabilities(self.forward(images))
    }
}

/// Scores change by the per-pixel distance between the pre and post spectra.
///
/// `p = sigmoid(scale * (rms(post - pre) - offset))`, computed on normalized
/// inputs. It has no weights and serves as a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DifferenceDetector {
    pub scale: f32,
    pub offset: f32,
}

impl Default for DifferenceDetector {
    fn default() -> Self {
        Self {
            scale: 4.0,
            offset: 1.0,
        }
    }
}

impl<B: Backend> ChangeDetector<B> for DifferenceDetector {
    fn family(&self) -> ModelFamily {
        ModelFamily::Difference
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (pre, post) = split_images(images);
        let distance = (post - pre).powf_scalar(2.0).mean_dim(1).sqrt();
        activation::sigmoid(distance.sub_scalar(self.offset).mul_scalar(self.scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_floats(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_family_conventions() {
        assert_eq!(
            ModelFamily::TinyCd.output_convention(),
            OutputConvention::Probability
        );
        assert_eq!(
            ModelFamily::DdpmCd.output_convention(),
            OutputConvention::SoftmaxClass { class: 1 }
        );
        assert_eq!("LS-Net".parse::<ModelFamily>().unwrap(), ModelFamily::LsNet);
        assert!("unet".parse::<ModelFamily>().is_err());
    }

    #[test]
    fn test_probability_passthrough() {
        let output = tensor(vec![0.1, 0.9, 0.4, 0.6], [1, 1, 2, 2]);
        let probs = OutputConvention::Probability.probabilities(output).unwrap();
        assert_eq!(probs.dims(), [1, 2, 2]);
        assert_eq!(probs.into_data().to_vec::<f32>().unwrap(), vec![0.1, 0.9, 0.4, 0.6]);
    }

    #[test]
    fn test_softmax_class_one() {
        // logits (0, 0) -> 0.5, (0, ln 3) -> 0.75
        let output = tensor(vec![0.0, 0.0, 0.0, 3f32.ln()], [1, 2, 1, 2]);
        let probs = OutputConvention::SoftmaxClass { class: 1 }
            .probabilities(output)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_convention_shape_errors() {
        let output = tensor(vec![0.0; 4], [1, 2, 1, 2]);
        assert!(OutputConvention::Probability.probabilities(output.clone()).is_err());
        assert!(OutputConvention::SoftmaxClass { class: 2 }
            .probabilities(output)
            .is_err());
    }

    #[test]
    fn test_difference_detector() {
        // pixel 0 unchanged, pixel 1 changed by 3 in every band
        let images = tensor(vec![1.0, 1.0, 2.0, 2.0, 1.0, 4.0, 2.0, 5.0], [1, 4, 1, 2]);
        let detector = DifferenceDetector::default();
        let probs = ChangeDetector::<TestBackend>::predict(&detector, images)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(probs[0] < 0.05);
        assert!(probs[1] > 0.95);
    }
}
