use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::ClusterSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_comparison_chunk")]
    pub comparison_chunk: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            comparison_chunk: default_comparison_chunk(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_comparison_chunk() -> usize {
    256
}

impl AnalysisConfig {
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            similarity_threshold: self.similarity_threshold,
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrency,
            comparison_chunk: self.comparison_chunk,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            keep_last: default_keep_last(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}
fn default_keep_last() -> usize {
    10
}

/// External command used for collection stores that are not plain
/// `collection.json` directories.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_bridge_timeout(),
        }
    }
}

fn default_bridge_timeout() -> u64 {
    120
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Config for `store_path` with every other setting at its default.
    /// Backups go to a `backups/` directory next to the store.
    pub fn minimal(store_path: impl Into<PathBuf>) -> Self {
        let path = store_path.into();
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join("backups"))
            .unwrap_or_else(default_backup_dir);
        Self {
            store: StoreConfig { path },
            analysis: AnalysisConfig::default(),
            backup: BackupConfig {
                directory,
                keep_last: default_keep_last(),
            },
            bridge: BridgeConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let threshold = config.analysis.similarity_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("analysis.similarity_threshold must be in (0.0, 1.0]");
    }

    if config.analysis.batch_size == 0 {
        anyhow::bail!("analysis.batch_size must be > 0");
    }

    if config.analysis.max_concurrency == 0 {
        anyhow::bail!("analysis.max_concurrency must be > 0");
    }

    if config.analysis.comparison_chunk == 0 {
        anyhow::bail!("analysis.comparison_chunk must be > 0");
    }

    if config.backup.keep_last == 0 {
        anyhow::bail!("backup.keep_last must be >= 1");
    }

    if let Some(command) = &config.bridge.command {
        if command.is_empty() {
            anyhow::bail!("bridge.command must name a program when set");
        }
    }

    if config.bridge.timeout_secs == 0 {
        anyhow::bail!("bridge.timeout_secs must be > 0");
    }

    Ok(())
}
