//! pidfinder configuration

use anyhow::{bail, Context, Result};
use pidfinder_lib::store::DEFAULT_FILE_NAME;
use pidfinder_lib::{LabelSchema, ObserverConfig, RetryPolicy, SchemaKind};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory that holds the record file
    #[serde(default = "default_result_path")]
    pub result_path: String,

    /// Record file name inside `result_path`
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Label layout used to build workload identities
    #[serde(default)]
    pub schema: SchemaKind,

    /// List stopped containers as well as running ones
    #[serde(default = "default_include_stopped")]
    pub include_stopped: bool,

    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds before a single inspect call is abandoned
    #[serde(default = "default_inspect_timeout")]
    pub inspect_timeout_secs: u64,

    /// Retries for a failed record file write before giving up
    #[serde(default = "default_save_retries")]
    pub save_retries: usize,

    /// Optional Prometheus textfile destination
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,
}

/// Falls back to the variable the original deployments set
fn default_result_path() -> String {
    std::env::var("RESULT_PATH").unwrap_or_default()
}

fn default_file_name() -> String {
    DEFAULT_FILE_NAME.to_string()
}

fn default_include_stopped() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

fn default_inspect_timeout() -> u64 {
    10
}

fn default_save_retries() -> usize {
    3
}

impl AgentConfig {
    /// Load configuration from `PIDFINDER_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PIDFINDER").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        Self::from_config(config)
    }

    /// Deserialize and validate an already assembled configuration
    pub fn from_config(config: config::Config) -> Result<Self> {
        let agent_config: AgentConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        agent_config.validate()?;
        Ok(agent_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.result_path.trim().is_empty() {
            bail!("No result directory configured; set RESULT_PATH or PIDFINDER_RESULT_PATH");
        }
        if self.file_name.trim().is_empty() {
            bail!("Record file name must not be empty");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.inspect_timeout_secs == 0 {
            bail!("inspect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Full path of the record file
    pub fn destination(&self) -> PathBuf {
        PathBuf::from(&self.result_path).join(&self.file_name)
    }

    /// Create the result directory if needed and check that it is a directory
    pub fn prepare_result_dir(&self) -> Result<()> {
        let dir = PathBuf::from(&self.result_path);
        if dir.exists() && !dir.is_dir() {
            bail!("Result path {} is not a directory", dir.display());
        }

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create result directory {}", dir.display()))
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            inspect_timeout: Duration::from_secs(self.inspect_timeout_secs),
            include_stopped: self.include_stopped,
            schema: LabelSchema::from(self.schema),
            metrics_textfile: self.metrics_textfile.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.save_retries,
            ..Default::default()
        }
    }
}
