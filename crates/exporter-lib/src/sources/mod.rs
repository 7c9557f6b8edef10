//! External data sources queried once per collection cycle
//!
//! The scheduler queue and the GPU device manager are modelled as injected
//! capabilities returning parsed rows, so the attribution engine can be
//! driven by in-memory fakes in tests. The production implementations shell
//! out to `squeue` and `nvidia-smi` under a bounded timeout.

mod command;
mod nvidia;
mod slurm;

pub use command::CommandRunner;
pub use nvidia::{parse_compute_apps, parse_gpu_list, parse_memory_bytes, NvidiaSmiSource};
pub use slurm::{parse_device_spec, parse_squeue, SqueueSource};

use crate::models::{ComputeProcess, DeviceInfo, DeviceRequest};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Source names used in logs, health components and failure metrics
pub mod names {
    pub const SCHEDULER: &str = "scheduler";
    pub const DEVICES: &str = "devices";
}

/// Failure of an external query. The whole source counts as unavailable
/// for the cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{program} produced non UTF-8 output")]
    InvalidOutput { program: String },
}

/// Job scheduler queue
#[async_trait]
pub trait SchedulerSource: Send + Sync {
    /// Requested GPU count of every queued or running job
    async fn device_requests(&self) -> Result<Vec<DeviceRequest>, SourceError>;
}

/// GPU device manager
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// All devices visible on this node
    async fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError>;

    /// Processes currently holding GPU memory
    async fn compute_processes(&self) -> Result<Vec<ComputeProcess>, SourceError>;
}
