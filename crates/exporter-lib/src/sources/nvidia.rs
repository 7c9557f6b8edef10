//! NVIDIA device manager source (`nvidia-smi`)

use super::{CommandRunner, DeviceSource, SourceError};
use crate::models::{ComputeProcess, DeviceInfo, Pid};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const GPU_QUERY: &str = "--query-gpu=gpu_uuid,index,name,utilization.gpu";
const APPS_QUERY: &str = "--query-compute-apps=pid,used_gpu_memory,gpu_uuid";
const CSV_FORMAT: &str = "--format=csv,noheader";

/// Device source backed by the `nvidia-smi` CLI
pub struct NvidiaSmiSource {
    runner: CommandRunner,
}

impl NvidiaSmiSource {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(program, timeout),
        }
    }
}

#[async_trait]
impl DeviceSource for NvidiaSmiSource {
    async fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let output = self.runner.run(&[GPU_QUERY, CSV_FORMAT]).await?;
        Ok(parse_gpu_list(&output))
    }

    async fn compute_processes(&self) -> Result<Vec<ComputeProcess>, SourceError> {
        let output = self.runner.run(&[APPS_QUERY, CSV_FORMAT]).await?;
        Ok(parse_compute_apps(&output))
    }
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// Parse `uuid, index, name, utilization` rows
pub fn parse_gpu_list(output: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts = split_row(line);
        if parts.len() != 4 {
            warn!(row = %line, "Malformed GPU list row");
            continue;
        }

        let index = match parts[1].parse::<u32>() {
            Ok(index) => index,
            Err(e) => {
                warn!(uuid = %parts[0], index = %parts[1], error = %e, "Failed to parse GPU index");
                continue;
            }
        };

        // "[N/A]" or "[Not Supported]" on some devices
        let utilization_percent = parts[3].trim_end_matches('%').trim().parse::<f64>().ok();

        devices.push(DeviceInfo {
            uuid: parts[0].to_string(),
            index,
            name: parts[2].to_string(),
            utilization_percent,
        });
    }

    devices
}

/// Parse `pid, used_memory, uuid` rows
pub fn parse_compute_apps(output: &str) -> Vec<ComputeProcess> {
    let mut processes = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts = split_row(line);
        if parts.len() != 3 {
            warn!(row = %line, "Malformed compute process row");
            continue;
        }

        let pid = match parts[0].parse::<u32>() {
            Ok(pid) => Pid(pid),
            Err(e) => {
                warn!(pid = %parts[0], error = %e, "Failed to parse compute process pid");
                continue;
            }
        };

        let Some(used_memory_bytes) = parse_memory_bytes(parts[1]) else {
            warn!(pid = %pid, memory = %parts[1], "Failed to parse used GPU memory");
            continue;
        };

        processes.push(ComputeProcess {
            pid,
            used_memory_bytes,
            gpu_uuid: parts[2].to_string(),
        });
    }

    processes
}

/// Convert an `nvidia-smi` memory reading such as `2048 MiB` to bytes.
/// A bare number is taken as MiB, the unit `nvidia-smi` reports in.
pub fn parse_memory_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "MiB" => 1024.0 * 1024.0,
        "KiB" => 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "B" => 1.0,
        _ => return None,
    };

    Some((number * multiplier).round() as u64)
}
