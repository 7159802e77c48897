//! Configuration management for the CLI

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Saved CLI defaults, overridden by flags and environment
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub api_url: Option<String>,
    pub default_format: Option<String>,
}

impl Config {
    /// Load `~/.config/clusterctl/config.json`, empty when missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("clusterctl").join("config.json"))
    }

    /// Flag or environment value first, then the saved default
    pub fn api_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn format(&self, flag: Option<OutputFormat>) -> OutputFormat {
        flag.or_else(|| self.default_format.as_deref()?.parse().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_url(None), DEFAULT_API_URL);
    }

    #[test]
    fn test_saved_defaults_yield_to_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let saved = Config {
            api_url: Some("http://gm-1:5000".to_string()),
            default_format: Some("json".to_string()),
        };
        saved.save_to(&path).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_url(None), "http://gm-1:5000");
        assert_eq!(config.api_url(Some("http://gm-2:5000".to_string())), "http://gm-2:5000");
        assert_eq!(config.format(None), OutputFormat::Json);
        assert_eq!(config.format(Some(OutputFormat::Table)), OutputFormat::Table);
    }
}
