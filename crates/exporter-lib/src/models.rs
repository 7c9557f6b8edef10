//! Core data models for the job metrics exporter

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Scheduler-assigned job identifier (the suffix of a `job_<id>` cgroup)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// OS process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GPU slot a job's memory is attributed to.
///
/// Device indexes are only meaningful within the cycle that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GpuSlot {
    /// Device index as reported by the device manager this cycle
    Index(u32),
    /// Placeholder for a live job with no GPU usage
    Unassigned,
}

impl fmt::Display for GpuSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuSlot::Index(index) => write!(f, "{}", index),
            GpuSlot::Unassigned => f.write_str("N/A"),
        }
    }
}

/// One row of the device manager's device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uuid: String,
    pub index: u32,
    pub name: String,
    /// Device-wide utilization percent, `None` when the device manager
    /// reports it as unavailable
    pub utilization_percent: Option<f64>,
}

/// One row of the device manager's active-process table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeProcess {
    pub pid: Pid,
    pub used_memory_bytes: u64,
    pub gpu_uuid: String,
}

/// One row of the scheduler queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub job_id: JobId,
    pub gpu_count: u32,
}

/// Cumulative block I/O counters of a single process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Result of one walk of the cgroup hierarchy.
///
/// Built once per cycle and shared read-only by every other component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Every live job, including jobs with no visible processes
    pub jobs: BTreeSet<JobId>,
    /// Process to owning job
    pub process_jobs: HashMap<Pid, JobId>,
}

impl Discovery {
    pub fn job_of(&self, pid: Pid) -> Option<&JobId> {
        self.process_jobs.get(&pid)
    }
}

/// Device-wide utilization reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUtilization {
    pub index: u32,
    pub name: String,
    pub percent: f64,
}

/// Output of the device correlator for one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceAttribution {
    /// GPU memory in bytes per job and device slot
    pub memory: BTreeMap<(JobId, GpuSlot), u64>,
    /// Requested GPU count per live job
    pub counts: BTreeMap<JobId, u32>,
    pub utilization: Vec<DeviceUtilization>,
}

/// I/O counters per job and process for one cycle
pub type IoAttribution = BTreeMap<(JobId, Pid), IoCounters>;
