//! Runs change detectors over chip batches and aggregates metrics.

use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::prelude::*;
use changedet_core::{ConfusionMeter, ConfusionScores, Error, EvaluationConfig, Result};
use changedet_dataset::{normalization_values, normalize_batch, ChannelStatistics, ChipBatch};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::metrics::{MetricAccumulator, MetricsReport};
use crate::model::ChangeDetector;

const BCE_EPS: f64 = 1e-7;

/// Confusion-matrix scores plus the mean per-batch BCE loss
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionReport {
    pub scores: ConfusionScores,
    pub loss: f64,
    pub batches: usize,
}

/// Probabilities and targets for one batch, both `[B, H, W]`
#[derive(Debug, Clone)]
pub struct BatchPrediction<B: Backend> {
    pub probabilities: Tensor<B, 3>,
    pub targets: Tensor<B, 3, Int>,
}

/// Evaluates models on batches of raw chips.
///
/// Images are normalized on the device with the band table of the configured
/// band set before they reach the model.
#[derive(Debug, Clone)]
pub struct Evaluator {
    config: EvaluationConfig,
    statistics: ChannelStatistics,
}

impl Evaluator {
    pub fn new(config: EvaluationConfig) -> Self {
        let statistics = normalization_values(config.bands).doubled();
        Self { config, statistics }
    }

    /// Uses `statistics` (covering both stacked images) instead of the band table
    pub fn with_statistics(config: EvaluationConfig, statistics: ChannelStatistics) -> Self {
        Self { config, statistics }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Normalizes a batch and runs the model on it
    pub fn predict<B: Backend, M: ChangeDetector<B> + ?Sized>(
        &self,
        model: &M,
        batch: &ChipBatch<B>,
    ) -> Result<BatchPrediction<B>> {
        let images = normalize_batch(batch.images.clone(), &self.statistics);
        let probabilities = model.predict(images)?;
        let targets = batch.masks.clone().squeeze::<3>(1);
        Ok(BatchPrediction {
            probabilities,
            targets,
        })
    }

    /// Computes metrics over every batch of `loader`
    pub fn evaluate<B: Backend, M: ChangeDetector<B> + ?Sized>(
        &self,
        model: &M,
        loader: &Arc<dyn DataLoader<ChipBatch<B>>>,
    ) -> Result<MetricsReport> {
        let mut accumulator = self.accumulator();
        let mut iter = loader.iter();

        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chips ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        while let Some(batch) = iter.next() {
            let prediction = self.predict(model, &batch)?;
            accumulator.update(prediction.probabilities, prediction.targets)?;

            let progress = iter.progress();
            pb.set_length(progress.items_total as u64);
            pb.set_position(progress.items_processed as u64);
        }
        pb.finish_and_clear();

        Ok(self.finish(accumulator))
    }

    /// Computes metrics over batches from any source
    pub fn evaluate_batches<B, M, I>(&self, model: &M, batches: I) -> Result<MetricsReport>
    where
        B: Backend,
        M: ChangeDetector<B> + ?Sized,
        I: IntoIterator<Item = ChipBatch<B>>,
    {
        let mut accumulator = self.accumulator();
        for batch in batches {
            let prediction = self.predict(model, &batch)?;
            accumulator.update(prediction.probabilities, prediction.targets)?;
        }
        Ok(self.finish(accumulator))
    }

    /// Thresholded confusion-matrix scores and mean binary cross-entropy
    pub fn evaluate_confusion<B, M, I>(&self, model: &M, batches: I) -> Result<ConfusionReport>
    where
        B: Backend,
        M: ChangeDetector<B> + ?Sized,
        I: IntoIterator<Item = ChipBatch<B>>,
    {
        let mut meter = ConfusionMeter::new(2);
        let mut loss_sum = 0.0;
        let mut batches_seen = 0;

        for batch in batches {
            let prediction = self.predict(model, &batch)?;
            let probs = prediction
                .probabilities
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("{e:?}")))?;
            let targets = prediction
                .targets
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|e| Error::Model(format!("{e:?}")))?;

            loss_sum += binary_cross_entropy(&probs, &targets);
            batches_seen += 1;

            let predicted: Vec<usize> = probs
                .iter()
                .map(|p| usize::from(*p > self.config.threshold))
                .collect();
            let actual: Vec<usize> = targets.iter().map(|t| usize::from(*t > 0)).collect();
            meter.update(&predicted, &actual);
        }

        let loss = if batches_seen > 0 {
            loss_sum / batches_seen as f64
        } else {
            0.0
        };
        debug!("Confusion matrix: {:?}", meter.matrix());
        Ok(ConfusionReport {
            scores: meter.scores(),
            loss,
            batches: batches_seen,
        })
    }

    fn accumulator(&self) -> MetricAccumulator {
        MetricAccumulator::new(self.config.threshold, self.config.pr_thresholds)
    }

    fn finish(&self, accumulator: MetricAccumulator) -> MetricsReport {
        let report = accumulator.compute();
        info!(
            "Evaluated {} chips: F1 {:.4}, IoU {:.4}, AP {:.4}",
            accumulator.images(),
            report.f1,
            report.iou,
            report.average_precision
        );
        report
    }
}

/// Mean binary cross-entropy of probabilities against `{0, 1}` targets
pub fn binary_cross_entropy(probs: &[f32], targets: &[i64]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let total: f64 = probs
        .iter()
        .zip(targets)
        .map(|(&p, &t)| {
            let p = f64::from(p).clamp(BCE_EPS, 1.0 - BCE_EPS);
            if t > 0 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / probs.len() as f64
}
