//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Crates whose events are raised to `debug` by `--verbose`
const WORKSPACE_TARGETS: [&str; 5] = [
    "changedet_core",
    "changedet_dataset",
    "changedet_eval",
    "prepare",
    "evaluate",
];

/// `--verbose` raises the workspace crates to `debug` and leaves burn, ureq
/// and friends at `info`; otherwise `RUST_LOG` applies, falling back to `info`
fn log_filter(verbose: bool) -> EnvFilter {
    if !verbose {
        return EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    }
    let directives = WORKSPACE_TARGETS
        .iter()
        .fold(String::from("info"), |mut acc, target| {
            acc.push(',');
            acc.push_str(target);
            acc.push_str("=debug");
            acc
        });
    EnvFilter::new(directives)
}

/// Installs the fmt subscriber for a tool; targets are shown when verbose
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(log_filter(verbose))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    debug!("Verbose logging enabled");
    Ok(())
}

/// Reads a TOML file into `T`; read and parse failures are [`Error::Config`]
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    debug!("Loading config {}", path.display());
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display())))
}

/// Writes `value` as pretty JSON, creating parent directories
pub fn write_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataModuleConfig;
    use tempfile::TempDir;

    #[test]
    fn test_load_toml_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datamodule.toml");
        fs::write(
            &path,
            "batch_size = 8\nval_split_pct = 0.25\n\n[dataset]\nroot = \"scenes\"\ntile_size = 64\n",
        )
        .unwrap();

        let config: DataModuleConfig = load_toml_config(&path).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.val_split_pct, 0.25);
        assert_eq!(config.dataset.geometry().unwrap().tile, (64, 64));
    }

    #[test]
    fn test_load_toml_config_missing() {
        let result: Result<DataModuleConfig> = load_toml_config(Path::new("/nonexistent.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_write_json_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/report.json");
        write_json(&path, &vec![1, 2, 3]).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains('2'));
    }

    #[test]
    fn test_verbose_filter_targets_workspace() {
        let filter = log_filter(true).to_string();
        assert!(filter.contains("changedet_dataset=debug"));
        assert!(filter.contains("evaluate=debug"));
        assert!(!filter.contains("burn"));
    }
}
