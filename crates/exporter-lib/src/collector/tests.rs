//! Integration tests for the attribution engine
//!
//! These tests build a mock Slurm cgroup tree and a mock proc filesystem in
//! a temp dir and drive full cycles with in-memory scheduler and device
//! sources.

#[cfg(test)]
mod mock_cgroup_tests {
    use crate::collector::{CollectionLoop, CollectionLoopBuilder, CycleError};
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{ComputeProcess, DeviceInfo, DeviceRequest, GpuSlot, JobId, Pid};
    use crate::publisher::SeriesKey;
    use crate::sources::{DeviceSource, SchedulerSource, SourceError};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::fs;

    /// What the external commands report on the next cycle
    #[derive(Default)]
    struct Cluster {
        requests: Vec<DeviceRequest>,
        devices: Vec<DeviceInfo>,
        processes: Vec<ComputeProcess>,
        scheduler_down: bool,
        devices_down: bool,
    }

    #[derive(Clone, Default)]
    struct MockCluster(Arc<Mutex<Cluster>>);

    impl MockCluster {
        fn update(&self, f: impl FnOnce(&mut Cluster)) {
            f(&mut self.0.lock().unwrap());
        }
    }

    #[async_trait]
    impl SchedulerSource for MockCluster {
        async fn device_requests(&self) -> Result<Vec<DeviceRequest>, SourceError> {
            let cluster = self.0.lock().unwrap();
            if cluster.scheduler_down {
                return Err(SourceError::Timeout {
                    program: "squeue".to_string(),
                    timeout: Duration::from_secs(5),
                });
            }
            Ok(cluster.requests.clone())
        }
    }

    #[async_trait]
    impl DeviceSource for MockCluster {
        async fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
            let cluster = self.0.lock().unwrap();
            if cluster.devices_down {
                return Err(SourceError::ExitStatus {
                    program: "nvidia-smi".to_string(),
                    status: std::process::ExitStatus::default(),
                    stderr: "NVIDIA-SMI has failed".to_string(),
                });
            }
            Ok(cluster.devices.clone())
        }

        async fn compute_processes(&self) -> Result<Vec<ComputeProcess>, SourceError> {
            Ok(self.0.lock().unwrap().processes.clone())
        }
    }

    struct Node {
        _temp_dir: TempDir,
        cgroup_root: PathBuf,
        proc_root: PathBuf,
    }

    impl Node {
        async fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let cgroup_root = temp_dir.path().join("cgroup/cpu/slurm");
            let proc_root = temp_dir.path().join("proc");
            fs::create_dir_all(&cgroup_root).await.unwrap();
            fs::create_dir_all(&proc_root).await.unwrap();

            Self {
                _temp_dir: temp_dir,
                cgroup_root,
                proc_root,
            }
        }

        fn job_dir(&self, uid: u32, job: &str) -> PathBuf {
            self.cgroup_root
                .join(format!("uid_{}", uid))
                .join(format!("job_{}", job))
        }

        /// Create `uid_<uid>/job_<job>/cgroup.procs`
        async fn add_job(&self, uid: u32, job: &str, pids: &[u32]) {
            write_procs(&self.job_dir(uid, job), pids).await;
        }

        async fn add_step(&self, uid: u32, job: &str, step: &str, pids: &[u32]) {
            let step_dir = self.job_dir(uid, job).join(format!("step_{}", step));
            write_procs(&step_dir, pids).await;
        }

        async fn remove_procs(&self, uid: u32, job: &str) {
            fs::remove_file(self.job_dir(uid, job).join("cgroup.procs"))
                .await
                .unwrap();
        }

        async fn remove_job(&self, uid: u32, job: &str) {
            fs::remove_dir_all(self.job_dir(uid, job)).await.unwrap();
        }

        /// Create `<proc>/<pid>/io`
        async fn add_process_io(&self, pid: u32, read_bytes: u64, write_bytes: u64) {
            let dir = self.proc_root.join(pid.to_string());
            fs::create_dir_all(&dir).await.unwrap();
            let io = format!(
                "rchar: 123456\nwchar: 654321\nsyscr: 10\nsyscw: 20\nread_bytes: {}\nwrite_bytes: {}\ncancelled_write_bytes: 0\n",
                read_bytes, write_bytes
            );
            fs::write(dir.join("io"), io).await.unwrap();
        }

        fn collection_loop(&self, cluster: &MockCluster, health: HealthRegistry) -> CollectionLoop {
            CollectionLoopBuilder::new()
                .cgroup_root(&self.cgroup_root)
                .proc_root(&self.proc_root)
                .scheduler(Arc::new(cluster.clone()))
                .devices(Arc::new(cluster.clone()))
                .health(health)
                .build()
                .unwrap()
        }
    }

    async fn write_procs(dir: &Path, pids: &[u32]) {
        fs::create_dir_all(dir).await.unwrap();
        let content: String = pids.iter().map(|pid| format!("{}\n", pid)).collect();
        fs::write(dir.join("cgroup.procs"), content).await.unwrap();
    }

    fn gpu(uuid: &str, index: u32, utilization: f64) -> DeviceInfo {
        DeviceInfo {
            uuid: uuid.to_string(),
            index,
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            utilization_percent: Some(utilization),
        }
    }

    fn memory_key(job: &str, gpu: GpuSlot) -> SeriesKey {
        SeriesKey::GpuMemory {
            job_id: JobId::new(job),
            gpu,
        }
    }

    fn count_key(job: &str) -> SeriesKey {
        SeriesKey::GpuCount {
            job_id: JobId::new(job),
        }
    }

    fn read_key(job: &str, pid: u32) -> SeriesKey {
        SeriesKey::IoRead {
            job_id: JobId::new(job),
            pid: Pid(pid),
        }
    }

    fn write_key(job: &str, pid: u32) -> SeriesKey {
        SeriesKey::IoWrite {
            job_id: JobId::new(job),
            pid: Pid(pid),
        }
    }

    /// One job with two processes, one of them on GPU 0
    async fn single_job_node(cluster: &MockCluster) -> Node {
        let node = Node::new().await;
        node.add_job(1000, "42", &[5001, 5002]).await;
        node.add_process_io(5001, 4096, 8192).await;
        node.add_process_io(5002, 0, 512).await;

        cluster.update(|c| {
            c.requests = vec![DeviceRequest {
                job_id: JobId::new("42"),
                gpu_count: 1,
            }];
            c.devices = vec![gpu("GPU-X", 0, 87.0)];
            c.processes = vec![ComputeProcess {
                pid: Pid(5001),
                used_memory_bytes: 2048 * 1024 * 1024,
                gpu_uuid: "GPU-X".to_string(),
            }];
        });

        node
    }

    #[tokio::test]
    async fn test_single_job_single_gpu_cycle() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());

        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.cycle, 1);
        assert_eq!(
            snapshot.value(&memory_key("42", GpuSlot::Index(0))),
            Some(2147483648.0)
        );
        assert_eq!(snapshot.value(&count_key("42")), Some(1.0));
        assert_eq!(snapshot.value(&read_key("42", 5001)), Some(4096.0));
        assert_eq!(snapshot.value(&write_key("42", 5001)), Some(8192.0));
        assert_eq!(snapshot.value(&read_key("42", 5002)), Some(0.0));
        assert_eq!(snapshot.value(&write_key("42", 5002)), Some(512.0));
        assert!(snapshot.value(&memory_key("42", GpuSlot::Unassigned)).is_none());

        let text = snapshot.render().unwrap();
        assert!(text.contains(r#"gpu_memory_usage_bytes{gpu_id="0",job_id="42"} 2147483648"#));
        assert!(text.contains(r#"gpu_count_per_job{job_id="42"} 1"#));
        assert!(text.contains(r#"gpu_utilization{gpu_id="0",gpu_name="NVIDIA A100-SXM4-40GB"} 87"#));
    }

    #[tokio::test]
    async fn test_finished_job_is_zeroed_next_cycle() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());

        collection_loop.run_cycle().await.unwrap();

        node.remove_job(1000, "42").await;
        cluster.update(|c| {
            c.requests.clear();
            c.processes.clear();
        });

        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.cycle, 2);
        assert_eq!(snapshot.value(&memory_key("42", GpuSlot::Index(0))), Some(0.0));
        assert_eq!(snapshot.value(&count_key("42")), Some(0.0));
        assert_eq!(snapshot.value(&read_key("42", 5001)), Some(0.0));
        assert_eq!(snapshot.value(&write_key("42", 5001)), Some(0.0));
        assert_eq!(snapshot.value(&write_key("42", 5002)), Some(0.0));

        // Nothing new showed up, so a further cycle is identical
        let again = collection_loop.run_cycle().await.unwrap();
        assert_eq!(again.series(), snapshot.series());
    }

    #[tokio::test]
    async fn test_emptied_membership_file_zeroes_process_series() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());

        collection_loop.run_cycle().await.unwrap();

        // The job cgroup remains but its processes are gone
        node.remove_procs(1000, "42").await;

        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.value(&memory_key("42", GpuSlot::Index(0))), Some(0.0));
        assert_eq!(
            snapshot.value(&memory_key("42", GpuSlot::Unassigned)),
            Some(0.0)
        );
        assert_eq!(snapshot.value(&count_key("42")), Some(1.0));
        for pid in [5001, 5002] {
            assert_eq!(snapshot.value(&read_key("42", pid)), Some(0.0));
            assert_eq!(snapshot.value(&write_key("42", pid)), Some(0.0));
        }
    }

    #[tokio::test]
    async fn test_device_manager_outage_zeroes_gpu_memory() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let health = HealthRegistry::new();
        let mut collection_loop = node.collection_loop(&cluster, health.clone());

        collection_loop.run_cycle().await.unwrap();
        cluster.update(|c| c.devices_down = true);

        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.value(&memory_key("42", GpuSlot::Index(0))), Some(0.0));
        assert_eq!(
            snapshot.value(&memory_key("42", GpuSlot::Unassigned)),
            Some(0.0)
        );
        let utilization = SeriesKey::GpuUtilization {
            gpu: 0,
            gpu_name: "NVIDIA A100-SXM4-40GB".to_string(),
        };
        assert_eq!(snapshot.value(&utilization), Some(0.0));
        assert_eq!(snapshot.value(&count_key("42")), Some(1.0));
        assert_eq!(snapshot.value(&read_key("42", 5001)), Some(4096.0));

        let report = health.health().await;
        assert_eq!(
            report.components[components::DEVICE_SOURCE].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            report.components[components::SCHEDULER_SOURCE].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_unreadable_process_io_reports_zero() {
        let cluster = MockCluster::default();
        let node = Node::new().await;
        // No <proc>/7001/io, the process exited after the walk
        node.add_job(1000, "43", &[7001]).await;

        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());
        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.value(&read_key("43", 7001)), Some(0.0));
        assert_eq!(snapshot.value(&write_key("43", 7001)), Some(0.0));
        assert_eq!(snapshot.value(&count_key("43")), Some(0.0));
        assert_eq!(
            snapshot.value(&memory_key("43", GpuSlot::Unassigned)),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_scheduler_timeout_degrades_but_commits() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        cluster.update(|c| c.scheduler_down = true);

        let health = HealthRegistry::new();
        let mut collection_loop = node.collection_loop(&cluster, health.clone());
        let snapshot = collection_loop.run_cycle().await.unwrap();

        assert_eq!(snapshot.value(&count_key("42")), Some(0.0));
        assert_eq!(
            snapshot.value(&memory_key("42", GpuSlot::Index(0))),
            Some(2147483648.0)
        );
        assert_eq!(snapshot.value(&read_key("42", 5001)), Some(4096.0));

        let report = health.health().await;
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert_eq!(
            report.components[components::SCHEDULER_SOURCE].status,
            ComponentStatus::Degraded
        );
        assert!(health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_unreadable_root_keeps_previous_snapshot() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let health = HealthRegistry::new();
        let mut collection_loop = node.collection_loop(&cluster, health.clone());
        let snapshots = collection_loop.snapshots();

        collection_loop.run_cycle().await.unwrap();
        fs::remove_dir_all(&node.cgroup_root).await.unwrap();

        let result = collection_loop.run_cycle().await;
        assert!(matches!(result, Err(CycleError::Walk(_))));

        let current = snapshots.load();
        assert_eq!(current.cycle, 1);
        assert_eq!(
            current.value(&memory_key("42", GpuSlot::Index(0))),
            Some(2147483648.0)
        );
        assert_eq!(
            health.health().await.components[components::HIERARCHY_WALKER].status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_foreign_gpu_process_is_not_attributed() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        cluster.update(|c| {
            c.processes.push(ComputeProcess {
                pid: Pid(9999),
                used_memory_bytes: 1024,
                gpu_uuid: "GPU-X".to_string(),
            })
        });

        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());
        let snapshot = collection_loop.run_cycle().await.unwrap();

        for key in snapshot.series().keys() {
            match key {
                SeriesKey::GpuMemory { job_id, .. }
                | SeriesKey::GpuCount { job_id }
                | SeriesKey::IoRead { job_id, .. }
                | SeriesKey::IoWrite { job_id, .. } => assert!(!job_id.as_str().is_empty()),
                SeriesKey::GpuUtilization { .. } => {}
            }
        }
        assert_eq!(
            snapshot.value(&memory_key("42", GpuSlot::Index(0))),
            Some(2147483648.0)
        );
    }

    #[tokio::test]
    async fn test_step_processes_belong_to_their_job() {
        let cluster = MockCluster::default();
        let node = Node::new().await;
        node.add_job(1000, "44", &[6001]).await;
        node.add_step(1000, "44", "0", &[6002]).await;
        node.add_step(1000, "44", "batch", &[6003]).await;
        node.add_job(1001, "45", &[]).await;

        let mut collection_loop = node.collection_loop(&cluster, HealthRegistry::new());
        let snapshot = collection_loop.run_cycle().await.unwrap();

        for pid in [6001, 6002, 6003] {
            assert_eq!(snapshot.value(&read_key("44", pid)), Some(0.0));
        }
        // Live but empty jobs are still reported
        assert_eq!(snapshot.value(&count_key("45")), Some(0.0));
    }

    #[tokio::test]
    async fn test_textfile_output_follows_snapshots() {
        let cluster = MockCluster::default();
        let node = single_job_node(&cluster).await;
        let out_dir = TempDir::new().unwrap();
        let path = out_dir.path().join("collector/job_metrics.prom");

        let mut collection_loop = CollectionLoopBuilder::new()
            .cgroup_root(&node.cgroup_root)
            .proc_root(&node.proc_root)
            .scheduler(Arc::new(cluster.clone()))
            .devices(Arc::new(cluster.clone()))
            .textfile_path(&path)
            .build()
            .unwrap();

        collection_loop.run_cycle().await.unwrap();

        let text = fs::read_to_string(&path).await.unwrap();
        assert!(text.contains(r#"io_read_bytes{job_id="42",pid="5001"} 4096"#));
    }
}
