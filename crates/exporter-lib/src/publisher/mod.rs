//! Snapshot publication with stale series reconciliation
//!
//! The publisher owns the only cross-cycle state of the exporter: the set of
//! series it published last cycle. Each cycle the previous key set is
//! diffed against the current inputs and every series that disappeared is
//! driven to zero, so scrapers observe a zeroed series rather than a gap.
//!
//! Committed snapshots are immutable and swapped behind an `Arc`; the HTTP
//! path only ever clones the pointer and never waits on a running cycle.

mod textfile;

pub use textfile::TextfileWriter;

use crate::models::{DeviceAttribution, GpuSlot, IoAttribution, JobId, Pid};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Attribution metrics exported per cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    GpuMemory,
    GpuCount,
    IoRead,
    IoWrite,
    GpuUtilization,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::GpuMemory,
        Metric::GpuCount,
        Metric::IoRead,
        Metric::IoWrite,
        Metric::GpuUtilization,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::GpuMemory => "gpu_memory_usage_bytes",
            Metric::GpuCount => "gpu_count_per_job",
            Metric::IoRead => "io_read_bytes",
            Metric::IoWrite => "io_write_bytes",
            Metric::GpuUtilization => "gpu_utilization",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Metric::GpuMemory => "GPU memory usage in bytes.",
            Metric::GpuCount => "Number of GPUs allocated per job.",
            Metric::IoRead => "IO read bytes.",
            Metric::IoWrite => "IO write bytes.",
            Metric::GpuUtilization => "Device-wide GPU utilization percentage.",
        }
    }

    fn label_names(&self) -> &'static [&'static str] {
        match self {
            Metric::GpuMemory => &["gpu_id", "job_id"],
            Metric::GpuCount => &["job_id"],
            Metric::IoRead | Metric::IoWrite => &["job_id", "pid"],
            Metric::GpuUtilization => &["gpu_id", "gpu_name"],
        }
    }
}

/// Identity of one published series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeriesKey {
    GpuMemory { job_id: JobId, gpu: GpuSlot },
    GpuCount { job_id: JobId },
    IoRead { job_id: JobId, pid: Pid },
    IoWrite { job_id: JobId, pid: Pid },
    GpuUtilization { gpu: u32, gpu_name: String },
}

impl SeriesKey {
    pub fn metric(&self) -> Metric {
        match self {
            SeriesKey::GpuMemory { .. } => Metric::GpuMemory,
            SeriesKey::GpuCount { .. } => Metric::GpuCount,
            SeriesKey::IoRead { .. } => Metric::IoRead,
            SeriesKey::IoWrite { .. } => Metric::IoWrite,
            SeriesKey::GpuUtilization { .. } => Metric::GpuUtilization,
        }
    }

    /// Label values in the order of `Metric::label_names`
    fn label_values(&self) -> Vec<String> {
        match self {
            SeriesKey::GpuMemory { job_id, gpu } => vec![gpu.to_string(), job_id.to_string()],
            SeriesKey::GpuCount { job_id } => vec![job_id.to_string()],
            SeriesKey::IoRead { job_id, pid } | SeriesKey::IoWrite { job_id, pid } => {
                vec![job_id.to_string(), pid.to_string()]
            }
            SeriesKey::GpuUtilization { gpu, gpu_name } => vec![gpu.to_string(), gpu_name.clone()],
        }
    }
}

/// Everything one collection cycle hands to the publisher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutput {
    pub devices: DeviceAttribution,
    pub io: IoAttribution,
}

impl CycleOutput {
    /// Flatten the cycle's attribution into series values
    pub fn series(&self) -> BTreeMap<SeriesKey, f64> {
        let mut series = BTreeMap::new();

        for ((job_id, gpu), bytes) in &self.devices.memory {
            series.insert(
                SeriesKey::GpuMemory {
                    job_id: job_id.clone(),
                    gpu: *gpu,
                },
                *bytes as f64,
            );
        }
        for (job_id, count) in &self.devices.counts {
            series.insert(
                SeriesKey::GpuCount {
                    job_id: job_id.clone(),
                },
                f64::from(*count),
            );
        }
        for device in &self.devices.utilization {
            series.insert(
                SeriesKey::GpuUtilization {
                    gpu: device.index,
                    gpu_name: device.name.clone(),
                },
                device.percent,
            );
        }
        for ((job_id, pid), counters) in &self.io {
            series.insert(
                SeriesKey::IoRead {
                    job_id: job_id.clone(),
                    pid: *pid,
                },
                counters.read_bytes as f64,
            );
            series.insert(
                SeriesKey::IoWrite {
                    job_id: job_id.clone(),
                    pid: *pid,
                },
                counters.write_bytes as f64,
            );
        }

        series
    }
}

/// An immutable, fully reconciled set of series
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Number of the cycle that committed this snapshot, 0 before the first
    pub cycle: u64,
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
    series: BTreeMap<SeriesKey, f64>,
    families: Vec<MetricFamily>,
}

impl Snapshot {
    fn build(cycle: u64, series: BTreeMap<SeriesKey, f64>) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let mut vecs = BTreeMap::new();

        for metric in Metric::ALL {
            let vec = GaugeVec::new(Opts::new(metric.name(), metric.help()), metric.label_names())?;
            registry.register(Box::new(vec.clone()))?;
            vecs.insert(metric, vec);
        }

        for (key, value) in &series {
            let values = key.label_values();
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            if let Some(vec) = vecs.get(&key.metric()) {
                vec.get_metric_with_label_values(&values)?.set(*value);
            }
        }

        Ok(Self {
            cycle,
            published_at: Some(chrono::Utc::now()),
            series,
            families: registry.gather(),
        })
    }

    pub fn value(&self, key: &SeriesKey) -> Option<f64> {
        self.series.get(key).copied()
    }

    pub fn series(&self) -> &BTreeMap<SeriesKey, f64> {
        &self.series
    }

    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Prometheus text exposition of this snapshot
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Shared read side of the publisher
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last committed snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, snapshot: Arc<Snapshot>) {
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Reconciles each cycle's attribution against the previous cycle and
/// commits the result
pub struct SnapshotPublisher {
    handle: SnapshotHandle,
    /// Series published last cycle, with the number of consecutive cycles
    /// each has been absent from the inputs
    previous: BTreeMap<SeriesKey, u32>,
    stale_retention_cycles: Option<u32>,
    cycle: u64,
}

impl SnapshotPublisher {
    /// Publisher that keeps zeroed series indefinitely
    pub fn new(handle: SnapshotHandle) -> Self {
        Self {
            handle,
            previous: BTreeMap::new(),
            stale_retention_cycles: None,
            cycle: 0,
        }
    }

    /// Drop a zeroed series after it has been absent for `cycles` cycles.
    /// At least one cycle is always kept so scrapers see the reset.
    pub fn with_stale_retention(mut self, cycles: Option<u32>) -> Self {
        self.stale_retention_cycles = cycles.map(|c| c.max(1));
        self
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Reconcile and commit one cycle's output
    pub fn publish(&mut self, output: &CycleOutput) -> prometheus::Result<Arc<Snapshot>> {
        let current = output.series();

        let mut series = BTreeMap::new();
        let mut tracked = BTreeMap::new();
        let mut reset = 0usize;

        for (key, cycles_absent) in &self.previous {
            if current.contains_key(key) {
                continue;
            }
            let cycles_absent = cycles_absent + 1;
            if matches!(self.stale_retention_cycles, Some(limit) if cycles_absent > limit) {
                continue;
            }
            if cycles_absent == 1 {
                reset += 1;
            }
            series.insert(key.clone(), 0.0);
            tracked.insert(key.clone(), cycles_absent);
        }

        for (key, value) in current {
            tracked.insert(key.clone(), 0);
            series.insert(key, value);
        }

        let snapshot = Arc::new(Snapshot::build(self.cycle + 1, series)?);
        self.cycle += 1;
        self.previous = tracked;
        self.handle.store(snapshot.clone());

        debug!(
            cycle = self.cycle,
            series = snapshot.len(),
            reset = reset,
            "Committed metrics snapshot"
        );

        Ok(snapshot)
    }
}
