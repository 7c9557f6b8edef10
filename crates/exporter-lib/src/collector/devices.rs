//! GPU attribution
//!
//! Joins the scheduler's GPU requests and the device manager's process
//! table against the walker's process map. The walker is the only source
//! of truth for which jobs are live.

use crate::models::{DeviceAttribution, DeviceUtilization, Discovery, GpuSlot, JobId};
use crate::sources::{names, DeviceSource, SchedulerSource, SourceError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of the external queries made during one correlation
#[derive(Debug, Default)]
pub struct CorrelationReport {
    pub scheduler_error: Option<SourceError>,
    pub device_error: Option<SourceError>,
    /// GPU processes that belong to no live job
    pub unresolved_processes: usize,
}

impl CorrelationReport {
    pub fn failed_sources(&self) -> Vec<(&'static str, &SourceError)> {
        let mut failed = Vec::new();
        if let Some(e) = &self.scheduler_error {
            failed.push((names::SCHEDULER, e));
        }
        if let Some(e) = &self.device_error {
            failed.push((names::DEVICES, e));
        }
        failed
    }
}

#[derive(Default)]
struct DeviceUsage {
    memory: BTreeMap<(JobId, GpuSlot), u64>,
    utilization: Vec<DeviceUtilization>,
    error: Option<SourceError>,
    unresolved: usize,
}

/// Attributes GPU memory and GPU requests to live jobs
pub struct DeviceCorrelator {
    scheduler: Arc<dyn SchedulerSource>,
    devices: Arc<dyn DeviceSource>,
}

impl DeviceCorrelator {
    pub fn new(scheduler: Arc<dyn SchedulerSource>, devices: Arc<dyn DeviceSource>) -> Self {
        Self { scheduler, devices }
    }

    pub async fn correlate(&self, discovery: &Discovery) -> (DeviceAttribution, CorrelationReport) {
        let (requests, usage) = tokio::join!(
            self.scheduler.device_requests(),
            self.device_usage(discovery)
        );

        let mut report = CorrelationReport {
            device_error: usage.error,
            unresolved_processes: usage.unresolved,
            ..Default::default()
        };

        let mut counts: BTreeMap<JobId, u32> =
            discovery.jobs.iter().map(|job| (job.clone(), 0)).collect();

        match requests {
            Ok(requests) => {
                for request in requests {
                    if let Some(count) = counts.get_mut(&request.job_id) {
                        *count = request.gpu_count;
                    } else {
                        debug!(job_id = %request.job_id, "Scheduler job not present in cgroup tree");
                    }
                }
            }
            Err(e) => report.scheduler_error = Some(e),
        }

        let mut memory = usage.memory;
        for job in &discovery.jobs {
            if !memory.keys().any(|(owner, _)| owner == job) {
                memory.insert((job.clone(), GpuSlot::Unassigned), 0);
            }
        }

        (
            DeviceAttribution {
                memory,
                counts,
                utilization: usage.utilization,
            },
            report,
        )
    }

    async fn device_usage(&self, discovery: &Discovery) -> DeviceUsage {
        let mut usage = DeviceUsage::default();

        let devices = match self.devices.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                usage.error = Some(e);
                return usage;
            }
        };

        // Indexes are rebuilt from scratch every cycle
        let index_by_uuid: HashMap<&str, u32> = devices
            .iter()
            .map(|device| (device.uuid.as_str(), device.index))
            .collect();

        usage.utilization = devices
            .iter()
            .filter_map(|device| {
                device.utilization_percent.map(|percent| DeviceUtilization {
                    index: device.index,
                    name: device.name.clone(),
                    percent,
                })
            })
            .collect();

        let processes = match self.devices.compute_processes().await {
            Ok(processes) => processes,
            // Utilization is still exported
            Err(e) => {
                usage.error = Some(e);
                return usage;
            }
        };

        for process in processes {
            let Some(&index) = index_by_uuid.get(process.gpu_uuid.as_str()) else {
                warn!(pid = %process.pid, uuid = %process.gpu_uuid, "GPU process on unknown device");
                continue;
            };

            let Some(job_id) = discovery.job_of(process.pid) else {
                warn!(pid = %process.pid, gpu_id = index, "GPU process not owned by any live job");
                usage.unresolved += 1;
                continue;
            };

            *usage
                .memory
                .entry((job_id.clone(), GpuSlot::Index(index)))
                .or_insert(0) += process.used_memory_bytes;
        }

        usage
    }
}
