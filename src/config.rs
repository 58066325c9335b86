//! Configuration file loading.
//!
//! The format is chosen by file extension: `.json`, `.yaml`/`.yml` or
//! `.toml`. A loaded config is validated before it is returned.

mod duration;

pub use duration::{parse_duration, parse_duration_to_secs};

use anyhow::Context;
use std::path::Path;
use sync_core::Config;

/// Config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => anyhow::bail!(
                "Unsupported config file extension: {} (expected .json, .yaml, .yml or .toml)",
                path.display()
            ),
        }
    }
}

/// Parse a config from a string.
pub fn parse_config(content: &str, format: ConfigFormat) -> anyhow::Result<Config> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
        ConfigFormat::Toml => toml::from_str(content)?,
    };
    config.validate()?;
    Ok(config)
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content, format)
        .with_context(|| format!("Failed to load config file {}", path.display()))
}
