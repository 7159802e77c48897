//! Group manager process configuration

use anyhow::{Context, Result};
use control_core::config::ControlConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/group-manager";

/// Everything the process reads at startup
///
/// Control settings sit at the top level (`node`, `thresholds`, ...); the
/// `http` and `repository` sections only concern this binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub control: ControlConfig,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub repository: RepositorySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    /// Timeout of ordinary calls to local controllers and peers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Power manager endpoint; host addresses are used when unset
    #[serde(default)]
    pub power_manager_address: Option<String>,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            power_manager_address: None,
        }
    }
}

impl HttpSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySettings {
    /// JSON snapshot file; the repository is purely in memory when unset
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval() -> u64 {
    30
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl RepositorySettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Settings {
    /// Load from the file named by `GM_CONFIG`, then `GM__*` environment variables
    pub fn load() -> Result<Self> {
        let file = std::env::var("GM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("GM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings
            .control
            .validate()
            .context("Invalid control configuration")?;
        Ok(settings)
    }
}
