//! Dataset preparation tool for chipped change-detection datasets.
//!
//! Subcommands:
//! - `download`: fetch, verify and extract a dataset archive
//! - `stats`: per-band mean and standard deviation over a split
//! - `index`: chip counts per scene for a tile geometry

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use changedet_core::{
    load_toml_config, setup_cli_logging, write_json, BandSet, ChipDatasetConfig, DataModuleConfig,
    RemoteArchive, Split, TileExtent,
};
use changedet_dataset::{compute_mean_std, download, ChipIndex, ManifestProvider, SceneProvider};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

#[derive(Parser)]
#[command(name = "prepare")]
#[command(about = "Prepare chipped change-detection datasets", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Dataset selection shared by subcommands that read scenes
#[derive(Args, Debug, Clone)]
struct DatasetArgs {
    /// Data module TOML; its `[dataset]` table is the starting point
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dataset root containing manifest.json
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Split to read: train or test
    #[arg(short, long)]
    split: Option<Split>,

    /// Band selection: rgb or all
    #[arg(short, long)]
    bands: Option<BandSet>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, verify and extract a dataset archive
    Download {
        /// Archive URL
        #[arg(short, long)]
        url: String,

        /// Expected SHA-256 of the archive
        #[arg(long)]
        sha256: String,

        /// Output directory; skipped when it already exists
        #[arg(short, long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Archive file name inside the output directory
        #[arg(long, default_value = "dataset.zip")]
        file_name: String,

        /// Skip digest verification
        #[arg(long)]
        no_checksum: bool,
    },

    /// Compute per-band mean and std over a split
    Stats {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Output file for statistics (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Report chip counts for a tile geometry
    Index {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Tile extent in pixels
        #[arg(short, long)]
        tile_size: Option<usize>,

        /// Step between tile origins in pixels
        #[arg(long)]
        stride: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    match cli.command {
        Commands::Download {
            url,
            sha256,
            output_dir,
            file_name,
            no_checksum,
        } => {
            let source = RemoteArchive {
                url,
                sha256,
                file_name,
            };
            download_dataset(&source, &output_dir, !no_checksum)?
        }

        Commands::Stats { dataset, output } => {
            dataset_stats(&resolve_dataset(&dataset)?, output.as_deref())?
        }

        Commands::Index {
            dataset,
            tile_size,
            stride,
        } => {
            let mut config = resolve_dataset(&dataset)?;
            if let Some(tile) = tile_size {
                config.tile_size = TileExtent::Square(tile);
            }
            if let Some(stride) = stride {
                config.stride = TileExtent::Square(stride);
            }
            index_dataset(&config)?
        }
    }

    Ok(())
}

/// Builds the dataset configuration from an optional TOML file and overrides
fn resolve_dataset(args: &DatasetArgs) -> Result<ChipDatasetConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let module: DataModuleConfig = load_toml_config(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            module.dataset
        }
        None => ChipDatasetConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(split) = args.split {
        config.split = split;
    }
    if let Some(bands) = args.bands {
        config.bands = bands;
    }
    Ok(config)
}

fn download_dataset(source: &RemoteArchive, output_dir: &Path, checksum: bool) -> Result<()> {
    info!("Preparing {} in {}", source.file_name, output_dir.display());
    download::prepare_archive(source, output_dir, checksum)
        .with_context(|| format!("Failed to prepare {}", source.url))?;
    println!("{} {}", "Dataset ready:".green().bold(), output_dir.display());
    Ok(())
}

fn dataset_stats(config: &ChipDatasetConfig, output: Option<&Path>) -> Result<()> {
    let provider = ManifestProvider::open(config).context("Failed to open dataset")?;
    info!(
        "Computing statistics over {} {} scenes",
        provider.len(),
        config.split
    );
    let statistics = compute_mean_std(&provider).context("Failed to compute statistics")?;

    println!("{}", "Band statistics".green().bold());
    for ((name, mean), std) in config
        .bands
        .band_names()
        .iter()
        .zip(&statistics.mean)
        .zip(&statistics.std)
    {
        println!("  {:<6} mean {:>12.4}  std {:>12.4}", name, mean, std);
    }

    if let Some(path) = output {
        write_json(path, &statistics)?;
        info!("Statistics exported to: {}", path.display());
    }
    Ok(())
}

fn index_dataset(config: &ChipDatasetConfig) -> Result<()> {
    let geometry = config.geometry()?;
    let provider = ManifestProvider::open(config).context("Failed to open dataset")?;
    let index = ChipIndex::build(&provider, geometry)?;

    println!(
        "{} tile {:?}, overlap {:?}",
        "Chip index".green().bold(),
        geometry.tile,
        geometry.overlap
    );
    for scene in 0..index.num_scenes() {
        let name = provider.scene_name(scene)?;
        let shape = index.scene_shape(scene).unwrap_or_default();
        let count = index.scene_chip_count(scene);
        let line = format!(
            "  {:<24} {:>5} x {:<5} {:>6} chips",
            name, shape[1], shape[2], count
        );
        if count == 0 {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }
    println!("  {} chips in total", index.len().to_string().bold());
    Ok(())
}
