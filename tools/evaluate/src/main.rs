//! Evaluation CLI Tool
//!
//! Runs a change detector over the test split of a chipped dataset and
//! exports metrics JSON, a precision-recall chart and prediction renders.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn_ndarray::NdArray;
use changedet_core::{
    load_toml_config, setup_cli_logging, write_json, DataModuleConfig, EvaluationConfig, Stage,
};
use changedet_dataset::{ChangeDetectionDataModule, ChipBatcher};
use changedet_eval::{
    save_prediction, write_pr_curve_svg, ChangeDetector, ConfusionReport, DifferenceDetector,
    Evaluator, MetricsReport, ModelFamily, PretrainedWeights, RenderOptions,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

type Backend = NdArray<f32>;

/// Detector selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ModelConfig {
    family: ModelFamily,
    /// Weight file; the family preset is used when unset
    weights: Option<PathBuf>,
    /// Cache for downloaded weights
    cache_dir: PathBuf,
    /// Parameters of the difference baseline
    difference: DifferenceDetector,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            family: ModelFamily::Difference,
            weights: None,
            cache_dir: PathBuf::from("weights"),
            difference: DifferenceDetector::default(),
        }
    }
}

/// Evaluation run configuration (TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct EvaluateConfig {
    datamodule: DataModuleConfig,
    evaluation: EvaluationConfig,
    model: ModelConfig,
    output_dir: PathBuf,
    /// Number of test chips to render
    renders: usize,
    /// Also report confusion-matrix scores and BCE loss
    confusion: bool,
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            datamodule: DataModuleConfig::default(),
            evaluation: EvaluationConfig::default(),
            model: ModelConfig::default(),
            output_dir: PathBuf::from("results"),
            renders: 4,
            confusion: false,
        }
    }
}

/// Everything written to `summary.json`
#[derive(Debug, Serialize)]
struct RunSummary {
    timestamp: String,
    family: ModelFamily,
    threshold: f32,
    chips: usize,
    metrics: MetricsReport,
    confusion: Option<ConfusionReport>,
    eval_time: f64,
}

#[derive(Parser, Debug)]
#[command(
    name = "evaluate",
    about = "Evaluate change-detection models",
    long_about = "Evaluate a change detector on the test split of a chipped dataset and \
                  export metrics, a precision-recall chart and prediction renders."
)]
struct Args {
    /// Evaluation config (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dataset root, overriding the config
    #[arg(short = 'd', long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Output directory, overriding the config
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Model family, overriding the config. Only `difference` runs here; for
    /// tinycd, lsnet and ddpmcd the weights are resolved (ddpmcd downloads)
    /// and the run then stops, since those networks are not linked in
    #[arg(short, long)]
    model: Option<ModelFamily>,

    /// Decision threshold, overriding the config
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Number of chips to render, overriding the config
    #[arg(long)]
    renders: Option<usize>,

    /// Also compute confusion-matrix scores and BCE loss
    #[arg(long)]
    confusion: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose)?;

    info!("Change Detection - Evaluation Tool");
    info!("==================================");

    let config = resolve_config(&args)?;
    let run_dir = config
        .output_dir
        .join(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
    std::fs::create_dir_all(&run_dir).context("Failed to create output directory")?;

    let detector = build_detector(&config.model)?;
    let summary = run_evaluation(&config, detector.as_ref(), &run_dir)?;

    print_results(&summary);
    write_json(&run_dir.join("summary.json"), &summary).context("Failed to write summary")?;

    info!("Evaluation completed successfully!");
    info!("Results saved to: {}", run_dir.display());
    Ok(())
}

fn resolve_config(args: &Args) -> Result<EvaluateConfig> {
    let mut config: EvaluateConfig = match &args.config {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EvaluateConfig::default(),
    };
    if let Some(root) = &args.data_root {
        config.datamodule.dataset.root = root.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(family) = args.model {
        config.model.family = family;
    }
    if let Some(threshold) = args.threshold {
        config.evaluation.threshold = threshold;
    }
    if let Some(renders) = args.renders {
        config.renders = renders;
    }
    config.confusion |= args.confusion;

    if config.evaluation.bands != config.datamodule.dataset.bands {
        anyhow::bail!(
            "evaluation bands ({}) differ from dataset bands ({})",
            config.evaluation.bands,
            config.datamodule.dataset.bands
        );
    }
    config.datamodule.validate()?;
    Ok(config)
}

fn build_detector(model: &ModelConfig) -> Result<Box<dyn ChangeDetector<Backend>>> {
    let preset = match model.family {
        ModelFamily::Difference => return Ok(Box::new(model.difference)),
        ModelFamily::TinyCd => PretrainedWeights::tinycd_oms2cd(),
        ModelFamily::LsNet => PretrainedWeights::lsnet_oms2cd(),
        ModelFamily::DdpmCd => PretrainedWeights::ddpmcd_oms2cd(&model.cache_dir),
    };
    let weights = match &model.weights {
        Some(path) => PretrainedWeights::local(model.family, path),
        None => preset,
    };
    let path = weights
        .resolve()
        .with_context(|| format!("Failed to resolve {} weights", model.family))?;
    anyhow::bail!(
        "{} weights found at {}, but no {} network is linked into this tool; \
         load them with changedet_eval::load_weights into your own ChangeDetector",
        model.family,
        path.display(),
        model.family
    )
}

fn run_evaluation(
    config: &EvaluateConfig,
    detector: &dyn ChangeDetector<Backend>,
    run_dir: &Path,
) -> Result<RunSummary> {
    let start_time = std::time::Instant::now();
    let device = Default::default();

    let mut datamodule = ChangeDetectionDataModule::new(config.datamodule.clone())
        .context("Failed to create data module")?;
    datamodule
        .setup(Stage::Test)
        .context("Failed to set up the test split")?;
    let chips = datamodule.test_dataset().map_or(0, |d| d.index().len());

    let evaluator = Evaluator::new(config.evaluation.clone());
    let loader = datamodule.test_dataloader::<Backend>(device)?;

    info!("Running evaluation with {}...", detector.family());
    let metrics = evaluator.evaluate(detector, &loader)?;

    let confusion = if config.confusion {
        Some(evaluator.evaluate_confusion(detector, loader.iter())?)
    } else {
        None
    };

    let chart_path = run_dir.join("pr_curve.svg");
    write_pr_curve_svg(
        &format!("Precision-Recall ({})", detector.family()),
        &metrics.pr_curve,
        &chart_path,
    )
    .context("Failed to write PR chart")?;
    info!("PR curve exported to: {}", chart_path.display());

    render_chips(&datamodule, &evaluator, detector, config, &run_dir.join("renders"))?;

    Ok(RunSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        family: detector.family(),
        threshold: config.evaluation.threshold,
        chips,
        metrics,
        confusion,
        eval_time: start_time.elapsed().as_secs_f64(),
    })
}

/// Renders the first `config.renders` test chips
fn render_chips(
    datamodule: &ChangeDetectionDataModule,
    evaluator: &Evaluator,
    detector: &dyn ChangeDetector<Backend>,
    config: &EvaluateConfig,
    dir: &Path,
) -> Result<()> {
    let Some(dataset) = datamodule.test_dataset() else {
        return Ok(());
    };
    let batcher = ChipBatcher::<Backend>::new(Default::default());
    let options = RenderOptions {
        bands: config.evaluation.bands,
        threshold: config.evaluation.threshold,
        ..Default::default()
    };

    let count = config.renders.min(dataset.index().len());
    for index in 0..count {
        let chip = dataset.try_get(index)?;
        let batch = batcher.batch(vec![chip.clone()]);
        let probabilities = evaluator
            .predict(detector, &batch)?
            .probabilities
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let path = dir.join(format!("chip_{index:05}.png"));
        if let Err(e) = save_prediction(&path, &chip.image, &chip.mask, &probabilities, &options) {
            warn!("Failed to render chip {}: {}", index, e);
        }
    }
    if count > 0 {
        info!("{} renders saved to: {}", count, dir.display());
    }
    Ok(())
}

fn print_results(summary: &RunSummary) {
    let m = &summary.metrics;
    info!("");
    info!("=== Evaluation Results ({}) ===", summary.family);
    info!("Chips:      {}", summary.chips);
    info!("Threshold:  {:.2}", summary.threshold);
    info!("OA:         {:.4}", m.overall_accuracy);
    info!("F1:         {:.4}", m.f1);
    info!("Precision:  {:.4}", m.precision);
    info!("Recall:     {:.4}", m.recall);
    info!("AP:         {:.4}", m.average_precision);
    info!("IoU:        {:.4}", m.iou);
    if let Some(confusion) = &summary.confusion {
        info!("BCE loss:   {:.4}", confusion.loss);
        for (name, value) in confusion.scores.to_map() {
            info!("  {:<10} {:.4}", name, value);
        }
    }
    info!("Evaluation Time: {:.2}s", summary.eval_time);
    info!("");
}

#[cfg(test)]
mod tests {
    use super::*;
    use changedet_core::BandSet;
    use clap::CommandFactory;
    use std::fs;
    use tempfile::TempDir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["evaluate"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_config_from_toml_with_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evaluate.toml");
        fs::write(
            &path,
            "renders = 2\n\n[datamodule]\nbatch_size = 4\n\n[datamodule.dataset]\nroot = \"scenes\"\n\n\
             [evaluation]\nthreshold = 0.4\n\n[model]\nfamily = \"difference\"\n",
        )
        .unwrap();
        let config_path = path.to_string_lossy().to_string();

        let config = resolve_config(&args(&["-c", &config_path, "-t", "0.6", "--confusion"])).unwrap();
        assert_eq!(config.datamodule.batch_size, 4);
        assert_eq!(config.datamodule.dataset.root, PathBuf::from("scenes"));
        assert_eq!(config.evaluation.threshold, 0.6);
        assert_eq!(config.renders, 2);
        assert!(config.confusion);
        assert_eq!(config.model.family, ModelFamily::Difference);
    }

    #[test]
    fn test_config_rejects_band_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evaluate.toml");
        fs::write(&path, "[evaluation]\nbands = \"all\"\n").unwrap();
        let config_path = path.to_string_lossy().to_string();

        assert!(resolve_config(&args(&["-c", &config_path])).is_err());
        assert_eq!(EvaluationConfig::default().bands, BandSet::Rgb);
    }

    #[test]
    fn test_missing_weights_fail() {
        let model = ModelConfig {
            family: ModelFamily::LsNet,
            weights: Some(PathBuf::from("/nonexistent/lsnet.mpk")),
            ..Default::default()
        };
        assert!(build_detector(&model).is_err());
        assert!(build_detector(&ModelConfig::default()).is_ok());
    }

    #[test]
    fn test_model_help_names_runnable_family() {
        let command = Args::command();
        let help = command
            .get_arguments()
            .find(|arg| arg.get_id() == "model")
            .and_then(|arg| arg.get_help())
            .map(|help| help.to_string())
            .unwrap();
        assert!(help.contains("Only `difference` runs here"));
    }
}
