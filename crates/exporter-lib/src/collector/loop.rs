//! Collection cycle and loop
//!
//! One cycle walks the cgroup tree once, runs GPU correlation and I/O
//! aggregation concurrently over that single walk, then reconciles and
//! commits a snapshot. Cycles run back to back on a fixed interval and
//! never overlap.

use super::{DeviceCorrelator, HierarchyWalker, IoAggregator, WalkError};
use crate::health::{components, HealthRegistry};
use crate::observability::{ExporterMetrics, StructuredLogger};
use crate::publisher::{CycleOutput, Snapshot, SnapshotHandle, SnapshotPublisher, TextfileWriter};
use crate::sources::{names, DeviceSource, SchedulerSource, SourceError};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

/// Configuration for the collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Collection interval (default: 10 seconds)
    pub interval: Duration,
    /// Slurm cgroup controller root
    pub cgroup_root: PathBuf,
    /// Root of the proc filesystem
    pub proc_root: PathBuf,
    /// Cycles a zeroed series is kept before removal, `None` keeps it forever
    pub stale_retention_cycles: Option<u32>,
    /// Optional node_exporter textfile output
    pub textfile_path: Option<PathBuf>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/cpu/slurm"),
            proc_root: PathBuf::from("/proc"),
            stale_retention_cycles: None,
            textfile_path: None,
        }
    }
}

/// Reasons a cycle committed nothing
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error("failed to build metrics snapshot: {0}")]
    Publish(#[from] prometheus::Error),
}

/// The attribution engine plus its periodic trigger
pub struct CollectionLoop {
    walker: HierarchyWalker,
    correlator: DeviceCorrelator,
    aggregator: IoAggregator,
    publisher: SnapshotPublisher,
    textfile: Option<TextfileWriter>,
    health: HealthRegistry,
    metrics: ExporterMetrics,
    logger: StructuredLogger,
    config: CollectionConfig,
}

impl CollectionLoop {
    /// Read side of the published snapshots
    pub fn snapshots(&self) -> SnapshotHandle {
        self.publisher.handle()
    }

    /// Run cycles until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            cgroup_root = %self.walker.cgroup_root().display(),
            "Starting metrics collection loop"
        );

        let mut ticker = interval(self.config.interval);
        // A slow cycle delays the next one instead of queueing a burst
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are logged and reported inside the cycle
                    let _ = self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics collection loop");
                    break;
                }
            }
        }
    }

    /// Run one full collection cycle and commit its snapshot.
    ///
    /// On error the previously committed snapshot stays published.
    pub async fn run_cycle(&mut self) -> Result<Arc<Snapshot>, CycleError> {
        let start = Instant::now();

        let discovery = match self.walker.discover().await {
            Ok(discovery) => {
                self.health.set_healthy(components::HIERARCHY_WALKER).await;
                discovery
            }
            Err(e) => {
                self.metrics.inc_cycle_failures();
                self.logger.log_cycle_failed(&e.to_string());
                self.health
                    .set_unhealthy(components::HIERARCHY_WALKER, e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        self.metrics
            .set_discovered(discovery.jobs.len(), discovery.process_jobs.len());

        let ((devices, report), io) = tokio::join!(
            self.correlator.correlate(&discovery),
            self.aggregator.aggregate(&discovery.process_jobs)
        );

        self.record_source_health(
            names::SCHEDULER,
            components::SCHEDULER_SOURCE,
            report.scheduler_error.as_ref(),
        )
        .await;
        self.record_source_health(
            names::DEVICES,
            components::DEVICE_SOURCE,
            report.device_error.as_ref(),
        )
        .await;
        if report.unresolved_processes > 0 {
            self.metrics
                .add_unresolved_gpu_processes(report.unresolved_processes);
        }

        let snapshot = match self.publisher.publish(&CycleOutput { devices, io }) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.inc_cycle_failures();
                self.logger.log_cycle_failed(&e.to_string());
                self.health
                    .set_unhealthy(components::PUBLISHER, e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        self.health.set_healthy(components::PUBLISHER).await;
        self.health.mark_committed(snapshot.cycle).await;

        if let Some(writer) = &self.textfile {
            if let Err(e) = writer.write(&snapshot).await {
                self.logger.log_textfile_failure(
                    &writer.path().display().to_string(),
                    &format!("{:#}", e),
                );
            }
        }

        let elapsed = start.elapsed();
        self.metrics.observe_cycle(elapsed.as_secs_f64());
        self.logger.log_cycle_complete(
            snapshot.cycle,
            discovery.jobs.len(),
            discovery.process_jobs.len(),
            snapshot.len(),
            elapsed.as_millis(),
        );

        Ok(snapshot)
    }

    async fn record_source_health(
        &self,
        source: &str,
        component: &str,
        error: Option<&SourceError>,
    ) {
        match error {
            Some(e) => {
                self.metrics.inc_source_failure(source);
                self.logger.log_source_unavailable(source, &e.to_string());
                self.health.set_degraded(component, e.to_string()).await;
            }
            None => self.health.set_healthy(component).await,
        }
    }
}

/// Builder for creating the collection loop
pub struct CollectionLoopBuilder {
    config: CollectionConfig,
    scheduler: Option<Arc<dyn SchedulerSource>>,
    devices: Option<Arc<dyn DeviceSource>>,
    health: Option<HealthRegistry>,
    snapshots: Option<SnapshotHandle>,
    logger: Option<StructuredLogger>,
}

impl CollectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CollectionConfig::default(),
            scheduler: None,
            devices: None,
            health: None,
            snapshots: None,
            logger: None,
        }
    }

    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the collection interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cgroup_root = path.into();
        self
    }

    pub fn proc_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.proc_root = path.into();
        self
    }

    pub fn stale_retention_cycles(mut self, cycles: Option<u32>) -> Self {
        self.config.stale_retention_cycles = cycles;
        self
    }

    pub fn textfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.textfile_path = Some(path.into());
        self
    }

    /// Set the scheduler queue source
    pub fn scheduler(mut self, source: Arc<dyn SchedulerSource>) -> Self {
        self.scheduler = Some(source);
        self
    }

    /// Set the GPU device source
    pub fn devices(mut self, source: Arc<dyn DeviceSource>) -> Self {
        self.devices = Some(source);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Share an existing snapshot handle, e.g. one already served over HTTP
    pub fn snapshots(mut self, handle: SnapshotHandle) -> Self {
        self.snapshots = Some(handle);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the collection loop
    pub fn build(self) -> Result<CollectionLoop> {
        let scheduler = self
            .scheduler
            .ok_or_else(|| anyhow::anyhow!("Scheduler source is required"))?;
        let devices = self
            .devices
            .ok_or_else(|| anyhow::anyhow!("Device source is required"))?;

        let publisher = SnapshotPublisher::new(self.snapshots.unwrap_or_default())
            .with_stale_retention(self.config.stale_retention_cycles);

        Ok(CollectionLoop {
            walker: HierarchyWalker::new(&self.config.cgroup_root),
            correlator: DeviceCorrelator::new(scheduler, devices),
            aggregator: IoAggregator::with_proc_root(&self.config.proc_root),
            publisher,
            textfile: self.config.textfile_path.as_ref().map(TextfileWriter::new),
            health: self.health.unwrap_or_default(),
            metrics: ExporterMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            config: self.config,
        })
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComputeProcess, DeviceInfo, DeviceRequest};
    use async_trait::async_trait;

    struct EmptyScheduler;

    #[async_trait]
    impl SchedulerSource for EmptyScheduler {
        async fn device_requests(&self) -> Result<Vec<DeviceRequest>, SourceError> {
            Ok(vec![])
        }
    }

    struct NoGpus;

    #[async_trait]
    impl DeviceSource for NoGpus {
        async fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
            Err(SourceError::Spawn {
                program: "nvidia-smi".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }

        async fn compute_processes(&self) -> Result<Vec<ComputeProcess>, SourceError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup/cpu/slurm"));
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert!(config.stale_retention_cycles.is_none());
    }

    #[test]
    fn test_collection_loop_builder() {
        let result = CollectionLoopBuilder::new()
            .scheduler(Arc::new(EmptyScheduler))
            .devices(Arc::new(NoGpus))
            .interval(Duration::from_secs(5))
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_collection_loop_builder_missing_scheduler() {
        let result = CollectionLoopBuilder::new().devices(Arc::new(NoGpus)).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let collection_loop = CollectionLoopBuilder::new()
            .scheduler(Arc::new(EmptyScheduler))
            .devices(Arc::new(NoGpus))
            .cgroup_root("/nonexistent/slurm")
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(collection_loop.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
