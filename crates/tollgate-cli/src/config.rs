//! CLI configuration management.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Directory holding one JSON document per run.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Instances allowed to run at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Upper bound applied to every step's own timeout.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_minutes: u64,
    /// Where `uses:` actions are looked up.
    #[serde(default = "default_actions_dir")]
    pub actions_dir: PathBuf,
    /// JSON file of secrets for the `file` provider.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    /// Prefix for the `env` provider, e.g. `TOLLGATE_SECRET`.
    #[serde(default)]
    pub secret_env_prefix: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "tollgate", "tollgate")
        .map(|dirs| dirs.data_local_dir().join("runs"))
        .unwrap_or_else(|| PathBuf::from(".tollgate/runs"))
}

fn default_max_workers() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    60
}

fn default_actions_dir() -> PathBuf {
    PathBuf::from(".tollgate/actions")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_workers: default_max_workers(),
            step_timeout_minutes: default_step_timeout(),
            actions_dir: default_actions_dir(),
            secrets_file: None,
            secret_env_prefix: None,
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "tollgate", "tollgate")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "state_dir" => self.state_dir = PathBuf::from(value),
            "max_workers" => {
                self.max_workers = value
                    .parse()
                    .with_context(|| format!("Invalid worker count: {}", value))?;
                if self.max_workers == 0 {
                    bail!("max_workers must be at least 1");
                }
            }
            "step_timeout_minutes" => {
                self.step_timeout_minutes = value
                    .parse()
                    .with_context(|| format!("Invalid timeout: {}", value))?;
            }
            "actions_dir" => self.actions_dir = PathBuf::from(value),
            "secrets_file" => self.secrets_file = optional(value).map(PathBuf::from),
            "secret_env_prefix" => self.secret_env_prefix = optional(value).map(str::to_string),
            "log_format" => {
                self.log_format = match value {
                    "pretty" => LogFormat::Pretty,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

/// An empty value clears an optional key.
fn optional(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
