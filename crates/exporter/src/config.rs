//! Exporter configuration

use anyhow::{Context, Result};
use exporter_lib::collector::CollectionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Node name used in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for /metrics, /healthz and /readyz
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Slurm cgroup controller root
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Metrics collection interval in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Deadline for each external command in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_squeue_path")]
    pub squeue_path: String,

    #[serde(default = "default_nvidia_smi_path")]
    pub nvidia_smi_path: String,

    /// Optional node_exporter textfile output
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,

    /// Cycles a zeroed series is kept, unset keeps it forever
    #[serde(default)]
    pub stale_retention_cycles: Option<u32>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_listen_port() -> u16 {
    9060
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/cpu/slurm")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_collection_interval() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    5
}

fn default_squeue_path() -> String {
    "squeue".to_string()
}

fn default_nvidia_smi_path() -> String {
    "nvidia-smi".to_string()
}

impl ExporterConfig {
    /// Load configuration from an optional file, then `EXPORTER_*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("EXPORTER"))
            .build()
            .context("Failed to read exporter configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid exporter configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.collection_interval_secs > 0,
            "collection_interval_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.command_timeout_secs > 0,
            "command_timeout_secs must be greater than zero"
        );
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            interval: Duration::from_secs(self.collection_interval_secs),
            cgroup_root: self.cgroup_root.clone(),
            proc_root: self.proc_root.clone(),
            stale_retention_cycles: self.stale_retention_cycles,
            textfile_path: self.textfile_path.clone(),
        }
    }
}
