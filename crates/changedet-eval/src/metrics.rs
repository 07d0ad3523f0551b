//! Streaming binary metrics for change maps.
//!
//! Pixels count as changed when their probability is strictly above the
//! decision threshold. Average precision and the exact precision-recall
//! curve rank every observed score, so all scores are kept until
//! [`MetricAccumulator::compute`].

use burn::prelude::*;
use changedet_core::{Error, Result};
use serde::{Deserialize, Serialize};

const IOU_SMOOTH: f64 = 1e-6;

/// Precision-recall curve.
///
/// `precision` and `recall` have one more entry than `thresholds`: the final
/// point is always `(recall 0, precision 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f64>,
}

/// Final evaluation metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    #[serde(rename = "OA")]
    pub overall_accuracy: f64,
    #[serde(rename = "F1")]
    pub f1: f64,
    pub recall: f64,
    pub precision: f64,
    #[serde(rename = "AP")]
    pub average_precision: f64,
    #[serde(rename = "PRC")]
    pub pr_curve: PrCurve,
    #[serde(rename = "IoU")]
    pub iou: f64,
}

/// Accumulates binary change metrics over batches
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    threshold: f32,
    tp: u64,
    fp: u64,
    tn: u64,
    fn_: u64,
    positive_scores: Vec<f32>,
    negative_scores: Vec<f32>,
    /// Evenly spaced thresholds and their `(tp, fp)` counts, if binned
    bins: Option<Vec<(f32, u64, u64)>>,
    iou_sum: f64,
    images: usize,
}

impl MetricAccumulator {
    /// `pr_thresholds` bins the PR curve on `linspace(0, 1, n)`; `None` keeps it exact
    pub fn new(threshold: f32, pr_thresholds: Option<usize>) -> Self {
        let bins = pr_thresholds.map(|n| {
            (0..n)
                .map(|i| {
                    let t = if n > 1 {
                        i as f32 / (n - 1) as f32
                    } else {
                        0.0
                    };
                    (t, 0, 0)
                })
                .collect()
        });
        Self {
            threshold,
            tp: 0,
            fp: 0,
            tn: 0,
            fn_: 0,
            positive_scores: Vec::new(),
            negative_scores: Vec::new(),
            bins,
            iou_sum: 0.0,
            images: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn images(&self) -> usize {
        self.images
    }

    /// Adds `images` equally sized probability maps and their 0/1 targets
    pub fn update_slices(&mut self, probs: &[f32], targets: &[i64], images: usize) -> Result<()> {
        if probs.len() != targets.len() {
            return Err(Error::InvalidArgument(format!(
                "{} predictions for {} targets",
                probs.len(),
                targets.len()
            )));
        }
        if images == 0 || probs.len() % images != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} pixels cannot be split into {} images",
                probs.len(),
                images
            )));
        }

        for (&p, &t) in probs.iter().zip(targets) {
            let predicted = p > self.threshold;
            let actual = t > 0;
            match (predicted, actual) {
                (true, true) => self.tp += 1,
                (true, false) => self.fp += 1,
                (false, false) => self.tn += 1,
                (false, true) => self.fn_ += 1,
            }
            if actual {
                self.positive_scores.push(p);
            } else {
                self.negative_scores.push(p);
            }
            if let Some(bins) = self.bins.as_mut() {
                for (t, tp, fp) in bins.iter_mut() {
                    if p >= *t {
                        if actual {
                            *tp += 1;
                        } else {
                            *fp += 1;
                        }
                    }
                }
            }
        }

        let pixels = probs.len() / images;
        for (image_probs, image_targets) in probs.chunks(pixels).zip(targets.chunks(pixels)) {
            self.iou_sum += iou_score(image_probs, image_targets, self.threshold);
        }
        self.images += images;
        Ok(())
    }

    /// Adds a `[B, H, W]` probability batch and its `[B, H, W]` targets
    pub fn update<B: Backend>(&mut self, probs: Tensor<B, 3>, targets: Tensor<B, 3, Int>) -> Result<()> {
        let images = probs.dims()[0];
        let probs = probs
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("{e:?}")))?;
        let targets = targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| Error::Model(format!("{e:?}")))?;
        self.update_slices(&probs, &targets, images)
    }

    pub fn compute(&self) -> MetricsReport {
        let (tp, fp, tn, fn_) = (
            self.tp as f64,
            self.fp as f64,
            self.tn as f64,
            self.fn_ as f64,
        );
        let pr_curve = match &self.bins {
            Some(bins) => self.binned_curve(bins),
            None => self.exact_curve(),
        };

        MetricsReport {
            overall_accuracy: safe_divide(tp + tn, tp + fp + tn + fn_, 0.0),
            f1: safe_divide(2.0 * tp, 2.0 * tp + fp + fn_, 0.0),
            recall: safe_divide(tp, tp + fn_, 0.0),
            precision: safe_divide(tp, tp + fp, 0.0),
            average_precision: average_precision(&self.exact_curve()),
            pr_curve,
            iou: safe_divide(self.iou_sum, self.images as f64, 0.0),
        }
    }

    fn binned_curve(&self, bins: &[(f32, u64, u64)]) -> PrCurve {
        let positives = self.positive_scores.len() as f64;
        let mut precision: Vec<f64> = bins
            .iter()
            .map(|(_, tp, fp)| safe_divide(*tp as f64, (*tp + *fp) as f64, 1.0))
            .collect();
        let mut recall: Vec<f64> = bins
            .iter()
            .map(|(_, tp, _)| safe_divide(*tp as f64, positives, 0.0))
            .collect();
        precision.push(1.0);
        recall.push(0.0);
        PrCurve {
            precision,
            recall,
            thresholds: bins.iter().map(|(t, _, _)| f64::from(*t)).collect(),
        }
    }

    /// Curve over every distinct score, ordered by increasing threshold
    fn exact_curve(&self) -> PrCurve {
        let mut scored: Vec<(f32, bool)> = self
            .positive_scores
            .iter()
            .map(|&p| (p, true))
            .chain(self.negative_scores.iter().map(|&p| (p, false)))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let positives = self.positive_scores.len() as f64;
        let mut precision = Vec::new();
        let mut recall = Vec::new();
        let mut thresholds = Vec::new();
        let (mut tp, mut fp) = (0u64, 0u64);

        for (i, &(score, actual)) in scored.iter().enumerate() {
            if actual {
                tp += 1;
            } else {
                fp += 1;
            }
            let last_of_value = scored.get(i + 1).map_or(true, |next| next.0 != score);
            if last_of_value {
                precision.push(safe_divide(tp as f64, (tp + fp) as f64, 0.0));
                recall.push(safe_divide(tp as f64, positives, 0.0));
                thresholds.push(f64::from(score));
            }
        }

        precision.reverse();
        recall.reverse();
        thresholds.reverse();
        precision.push(1.0);
        recall.push(0.0);
        PrCurve {
            precision,
            recall,
            thresholds,
        }
    }
}

/// Step-wise area under an exact curve: `sum((R[k] - R[k+1]) * P[k])`
fn average_precision(curve: &PrCurve) -> f64 {
    curve
        .recall
        .windows(2)
        .zip(&curve.precision)
        .map(|(r, p)| (r[0] - r[1]) * p)
        .sum()
}

fn safe_divide(numerator: f64, denominator: f64, zero_division: f64) -> f64 {
    if denominator == 0.0 {
        zero_division
    } else {
        numerator / denominator
    }
}

/// Smoothed IoU of one image after thresholding both prediction and target
pub fn iou_score(probs: &[f32], targets: &[i64], threshold: f32) -> f64 {
    let mut intersection = 0u64;
    let mut union = 0u64;
    for (&p, &t) in probs.iter().zip(targets) {
        let predicted = p > threshold;
        let actual = t as f32 > threshold;
        if predicted && actual {
            intersection += 1;
        }
        if predicted || actual {
            union += 1;
        }
    }
    (intersection as f64 + IOU_SMOOTH) / (union as f64 + IOU_SMOOTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_threshold_metrics() {
        let mut acc = MetricAccumulator::new(0.5, None);
        // tp, fp, tn, fn, tp, tn
        acc.update_slices(&[0.9, 0.6, 0.1, 0.4, 0.7, 0.5], &[1, 0, 0, 1, 1, 0], 1)
            .unwrap();
        let report = acc.compute();

        assert!(close(report.overall_accuracy, 4.0 / 6.0));
        assert!(close(report.precision, 2.0 / 3.0));
        assert!(close(report.recall, 2.0 / 3.0));
        assert!(close(report.f1, 4.0 / 6.0));
    }

    #[test]
    fn test_average_precision_exact() {
        let mut acc = MetricAccumulator::new(0.5, None);
        // ranking: 0.9 (+), 0.8 (-), 0.7 (+), 0.1 (-)
        acc.update_slices(&[0.9, 0.8, 0.7, 0.1], &[1, 0, 1, 0], 1).unwrap();
        let report = acc.compute();

        // 0.5 * 1 + 0.5 * 2/3
        assert!(close(report.average_precision, 0.5 + 1.0 / 3.0));
        assert_eq!(report.pr_curve.thresholds, vec![0.1f32 as f64, 0.7f32 as f64, 0.8f32 as f64, 0.9f32 as f64]);
        assert_eq!(report.pr_curve.precision.len(), 5);
        assert_eq!(*report.pr_curve.precision.last().unwrap(), 1.0);
        assert_eq!(*report.pr_curve.recall.last().unwrap(), 0.0);
        assert!(close(report.pr_curve.precision[0], 0.5));
        assert!(close(report.pr_curve.recall[0], 1.0));
    }

    #[test]
    fn test_tied_scores_share_threshold() {
        let mut acc = MetricAccumulator::new(0.5, None);
        acc.update_slices(&[0.6, 0.6, 0.2], &[1, 0, 1], 1).unwrap();
        let report = acc.compute();
        assert_eq!(report.pr_curve.thresholds.len(), 2);
        // ranking: {0.6: +,-}, {0.2: +}; AP = 0.5 * 0.5 + 0.5 * 2/3
        assert!(close(report.average_precision, 0.25 + 1.0 / 3.0));
    }

    #[test]
    fn test_binned_curve() {
        let mut acc = MetricAccumulator::new(0.5, Some(3));
        acc.update_slices(&[0.9, 0.4, 0.6, 0.2], &[1, 1, 0, 0], 1).unwrap();
        let curve = acc.compute().pr_curve;

        assert_eq!(curve.thresholds, vec![0.0, 0.5, 1.0]);
        // >= 0.0: tp 2 fp 2; >= 0.5: tp 1 fp 1; >= 1.0: nothing -> precision 1
        assert_eq!(curve.precision, vec![0.5, 0.5, 1.0, 1.0]);
        assert_eq!(curve.recall, vec![1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_iou_averaged_per_image() {
        let mut acc = MetricAccumulator::new(0.5, Some(2));
        // image 1: perfect; image 2: no overlap
        acc.update_slices(&[0.9, 0.1, 0.9, 0.1], &[1, 0, 0, 1], 2).unwrap();
        // image 3: empty prediction and target
        acc.update_slices(&[0.1, 0.2], &[0, 0], 1).unwrap();

        let report = acc.compute();
        assert_eq!(acc.images(), 3);
        let expected = (1.0 + IOU_SMOOTH / (2.0 + IOU_SMOOTH) + 1.0) / 3.0;
        assert!(close(report.iou, expected));
    }

    #[test]
    fn test_update_validates_shapes() {
        let mut acc = MetricAccumulator::new(0.5, None);
        assert!(acc.update_slices(&[0.1, 0.2], &[0], 1).is_err());
        assert!(acc.update_slices(&[0.1, 0.2, 0.3], &[0, 0, 0], 2).is_err());
    }

    #[test]
    fn test_update_from_tensors() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 3>::from_floats(
            TensorData::new(vec![0.9f32, 0.2, 0.8, 0.1], [2, 1, 2]),
            &device,
        );
        let targets = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![1i64, 0, 1, 0], [2, 1, 2]),
            &device,
        );
        let mut acc = MetricAccumulator::new(0.3, Some(50));
        acc.update(probs, targets).unwrap();
        let report = acc.compute();
        assert_eq!(report.overall_accuracy, 1.0);
        assert_eq!(report.pr_curve.thresholds.len(), 50);
        assert!(close(report.iou, 1.0));
    }

    #[test]
    fn test_report_keys() {
        let report = MetricAccumulator::new(0.3, Some(5)).compute();
        let json = serde_json::to_value(&report).unwrap();
        for key in ["OA", "F1", "recall", "precision", "AP", "PRC", "IoU"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json["PRC"].get("thresholds").is_some());
    }
}
