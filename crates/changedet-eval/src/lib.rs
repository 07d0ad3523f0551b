//! Evaluation of change-detection models on chipped datasets.
//!
//! - [`model`]: the detector interface and per-family output conventions
//! - [`weights`]: pretrained weight presets, download and loading
//! - [`evaluator`]: batch prediction and metric aggregation
//! - [`metrics`]: OA, F1, precision, recall, AP, PR curve and IoU
//! - [`plot`], [`charts`]: prediction mosaics and the PR chart

pub mod charts;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod plot;
pub mod weights;

pub use charts::{pr_chart_points, viridis, write_pr_curve_svg, PrChartPoint};
pub use evaluator::{binary_cross_entropy, BatchPrediction, ConfusionReport, Evaluator};
pub use metrics::{iou_score, MetricAccumulator, MetricsReport, PrCurve};
pub use model::{ChangeDetector, DifferenceDetector, ModelFamily, OutputConvention};
pub use plot::{render_prediction, save_prediction, RenderOptions};
pub use weights::{load_weights, PretrainedWeights, WeightSource, FINAL_WEIGHTS_DIR};
