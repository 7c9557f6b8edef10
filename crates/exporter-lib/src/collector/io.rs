//! Per-process block I/O counters from `/proc/<pid>/io`

use crate::models::{IoAttribution, IoCounters, JobId, Pid};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

/// Reads cumulative I/O counters for every discovered process
#[derive(Debug, Clone)]
pub struct IoAggregator {
    proc_root: PathBuf,
}

impl IoAggregator {
    /// Create an aggregator reading from `/proc`
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Create an aggregator with a custom proc path (for testing)
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Attribute I/O counters to each (job, process) pair.
    ///
    /// Every input process yields an entry; unreadable files and missing
    /// keys contribute zero.
    pub async fn aggregate(&self, process_jobs: &HashMap<Pid, JobId>) -> IoAttribution {
        let mut attribution = IoAttribution::new();

        for (&pid, job_id) in process_jobs {
            let path = self.proc_root.join(pid.0.to_string()).join("io");
            let counters = match fs::read_to_string(&path).await {
                Ok(content) => parse_io(pid, &content),
                Err(e) => {
                    // The process exited after the walk
                    debug!(pid = %pid, job_id = %job_id, error = %e, "I/O counters unavailable");
                    IoCounters::default()
                }
            };
            attribution.insert((job_id.clone(), pid), counters);
        }

        attribution
    }
}

impl Default for IoAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the `key: value` lines of a proc io file, keeping only the
/// byte counters that reached storage
pub fn parse_io(pid: Pid, content: &str) -> IoCounters {
    let mut counters = IoCounters::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key != "read_bytes" && key != "write_bytes" {
            continue;
        }

        let value = match value.trim().parse::<u64>() {
            Ok(value) => value,
            Err(e) => {
                warn!(pid = %pid, key = %key, error = %e, "Failed to parse I/O counter");
                continue;
            }
        };

        if key == "read_bytes" {
            counters.read_bytes = value;
        } else {
            counters.write_bytes = value;
        }
    }

    counters
}
