use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::pipeline::TilingOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";
pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub tiling: TilingOptions,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub default_model: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml on first run.
/// An existing config file is never touched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
