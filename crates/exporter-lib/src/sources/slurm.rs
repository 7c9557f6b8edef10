//! Slurm queue source (`squeue`)

use super::{CommandRunner, SchedulerSource, SourceError};
use crate::models::{DeviceRequest, JobId};
use async_trait::async_trait;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Job id and per-node GRES request columns. The request column has no
/// width so typed requests such as `gres/gpu:a100:2` are not truncated.
const SQUEUE_FORMAT: &str = "%.18i %b";

/// Scheduler source backed by the `squeue` CLI
pub struct SqueueSource {
    runner: CommandRunner,
}

impl SqueueSource {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(program, timeout),
        }
    }
}

#[async_trait]
impl SchedulerSource for SqueueSource {
    async fn device_requests(&self) -> Result<Vec<DeviceRequest>, SourceError> {
        let output = self
            .runner
            .run(&["--noheader", "-o", SQUEUE_FORMAT])
            .await?;
        Ok(parse_squeue(&output))
    }
}

/// Parse `squeue` rows of the form `<job_id> <device_spec>`.
///
/// Rows with an unparseable GPU count are skipped with a warning. A header
/// row is tolerated.
pub fn parse_squeue(output: &str) -> Vec<DeviceRequest> {
    let mut requests = Vec::new();

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(job_id) = fields.next() else {
            continue;
        };
        if job_id == "JOBID" {
            continue;
        }

        let spec = fields.next().unwrap_or("");
        match parse_device_spec(spec) {
            Ok(gpu_count) => requests.push(DeviceRequest {
                job_id: JobId::new(job_id),
                gpu_count,
            }),
            Err(e) => {
                warn!(job_id = %job_id, spec = %spec, error = %e, "Failed to parse GPU count");
            }
        }
    }

    requests
}

/// Extract the GPU count from a GRES request.
///
/// Accepts `gpu:N`, `gpu:<type>:N`, optionally prefixed by `gres:` or
/// `gres/` and possibly among other comma separated resources. Anything
/// without a GPU entry (`N/A`, `(null)`, empty) requests zero devices.
pub fn parse_device_spec(spec: &str) -> Result<u32, ParseIntError> {
    for resource in spec.split(',') {
        let resource = resource
            .strip_prefix("gres:")
            .or_else(|| resource.strip_prefix("gres/"))
            .unwrap_or(resource);

        if let Some(rest) = resource.strip_prefix("gpu:") {
            let count = rest.rsplit(':').next().unwrap_or(rest);
            return count.trim().parse();
        }
    }

    Ok(0)
}
