//! Confusion-matrix scores for pixel-wise change maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const EPS: f64 = f32::EPSILON as f64;

/// Accumulates a confusion matrix (actual x predicted) over label maps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionMeter {
    num_classes: usize,
    matrix: Vec<Vec<u64>>,
}

/// Scores derived from a confusion matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionScores {
    /// Overall pixel accuracy
    pub accuracy: f64,
    /// Mean intersection over union across classes
    pub mean_iou: f64,
    /// Mean F1 across classes
    pub mean_f1: f64,
    pub per_class_iou: Vec<f64>,
    pub per_class_f1: Vec<f64>,
    pub per_class_precision: Vec<f64>,
    pub per_class_recall: Vec<f64>,
}

impl ConfusionMeter {
    /// Creates a meter for `num_classes` labels
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn matrix(&self) -> &[Vec<u64>] {
        &self.matrix
    }

    /// Adds paired predicted/actual labels; out-of-range labels are ignored
    pub fn update(&mut self, predicted: &[usize], actual: &[usize]) {
        for (&pred, &gt) in predicted.iter().zip(actual.iter()) {
            if pred < self.num_classes && gt < self.num_classes {
                self.matrix[gt][pred] += 1;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.matrix.iter().flatten().sum()
    }

    /// Computes scores from the accumulated matrix
    pub fn scores(&self) -> ConfusionScores {
        let n = self.num_classes;
        let total = self.total() as f64;
        let tp: Vec<f64> = (0..n).map(|i| self.matrix[i][i] as f64).collect();
        let actual: Vec<f64> = (0..n)
            .map(|i| self.matrix[i].iter().sum::<u64>() as f64)
            .collect();
        let predicted: Vec<f64> = (0..n)
            .map(|j| (0..n).map(|i| self.matrix[i][j]).sum::<u64>() as f64)
            .collect();

        let accuracy = tp.iter().sum::<f64>() / (total + EPS);
        let recall: Vec<f64> = (0..n).map(|i| tp[i] / (actual[i] + EPS)).collect();
        let precision: Vec<f64> = (0..n).map(|i| tp[i] / (predicted[i] + EPS)).collect();
        let f1: Vec<f64> = (0..n)
            .map(|i| 2.0 * recall[i] * precision[i] / (recall[i] + precision[i] + EPS))
            .collect();
        let iou: Vec<f64> = (0..n)
            .map(|i| tp[i] / (actual[i] + predicted[i] - tp[i] + EPS))
            .collect();

        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        ConfusionScores {
            accuracy,
            mean_iou: mean(&iou),
            mean_f1: mean(&f1),
            per_class_iou: iou,
            per_class_f1: f1,
            per_class_precision: precision,
            per_class_recall: recall,
        }
    }
}

impl ConfusionScores {
    /// Flat `name -> value` view (`acc`, `miou`, `mf1`, `iou_1`, `F1_1`, ...)
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("acc".to_string(), self.accuracy);
        map.insert("miou".to_string(), self.mean_iou);
        map.insert("mf1".to_string(), self.mean_f1);
        for (i, value) in self.per_class_iou.iter().enumerate() {
            map.insert(format!("iou_{i}"), *value);
        }
        for (i, value) in self.per_class_f1.iter().enumerate() {
            map.insert(format!("F1_{i}"), *value);
        }
        for (i, value) in self.per_class_precision.iter().enumerate() {
            map.insert(format!("precision_{i}"), *value);
        }
        for (i, value) in self.per_class_recall.iter().enumerate() {
            map.insert(format!("recall_{i}"), *value);
        }
        map
    }
}
