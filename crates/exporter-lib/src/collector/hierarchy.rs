//! Slurm cgroup hierarchy walker
//!
//! Discovers live jobs and their processes from the scheduler's cgroup
//! controller tree:
//! - `<root>/uid_<uid>/job_<id>/cgroup.procs`
//! - `<root>/uid_<uid>/job_<id>/step_<step>/cgroup.procs`

use crate::models::{Discovery, JobId, Pid};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

const UID_PREFIX: &str = "uid_";
const JOB_PREFIX: &str = "job_";
const STEP_PREFIX: &str = "step_";
const PROCS_FILE: &str = "cgroup.procs";

/// The controller root itself could not be read; no job set can be trusted
#[derive(Debug, Error)]
#[error("failed to read cgroup root {path}: {source}")]
pub struct WalkError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Walker over the Slurm cgroup tree
#[derive(Debug, Clone)]
pub struct HierarchyWalker {
    cgroup_root: PathBuf,
}

impl HierarchyWalker {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
        }
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    /// Walk the tree once and build the live job set and process map
    pub async fn discover(&self) -> Result<Discovery, WalkError> {
        let walk_error = |source| WalkError {
            path: self.cgroup_root.clone(),
            source,
        };

        let uid_dirs = list_prefixed_dirs(&self.cgroup_root, UID_PREFIX)
            .await
            .map_err(walk_error)?;

        let mut discovery = Discovery::default();

        for (uid_name, uid_path) in uid_dirs {
            let job_dirs = match list_prefixed_dirs(&uid_path, JOB_PREFIX).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(uid = %uid_name, error = %e, "Failed to list jobs in uid directory");
                    continue;
                }
            };

            for (job_name, job_path) in job_dirs {
                let job_id = JobId::new(&job_name[JOB_PREFIX.len()..]);
                let pids = Self::read_job_pids(&job_id, &job_path).await;

                if pids.is_empty() {
                    warn!(job_id = %job_id, uid = %uid_name, "No processes found for job");
                }

                for pid in pids {
                    if let Some(owner) = discovery.process_jobs.get(&pid) {
                        warn!(
                            pid = %pid,
                            job_id = %job_id,
                            owner = %owner,
                            "Process listed under more than one job, keeping first"
                        );
                        continue;
                    }
                    discovery.process_jobs.insert(pid, job_id.clone());
                }

                discovery.jobs.insert(job_id);
            }
        }

        debug!(
            jobs = discovery.jobs.len(),
            processes = discovery.process_jobs.len(),
            "Walked cgroup hierarchy"
        );

        Ok(discovery)
    }

    /// Union of the job level and step level membership files
    async fn read_job_pids(job_id: &JobId, job_path: &Path) -> BTreeSet<Pid> {
        let mut pids = BTreeSet::new();

        match fs::read_to_string(job_path.join(PROCS_FILE)).await {
            Ok(content) => pids.extend(parse_procs(job_id, &content)),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read job cgroup.procs");
            }
        }

        // Step cgroups are optional
        if let Ok(steps) = list_prefixed_dirs(job_path, STEP_PREFIX).await {
            for (step_name, step_path) in steps {
                match fs::read_to_string(step_path.join(PROCS_FILE)).await {
                    Ok(content) => pids.extend(parse_procs(job_id, &content)),
                    Err(e) => {
                        debug!(job_id = %job_id, step = %step_name, error = %e, "Step cgroup.procs unreadable");
                    }
                }
            }
        }

        pids
    }
}

/// Parse a `cgroup.procs` file, one pid per line
pub fn parse_procs(job_id: &JobId, content: &str) -> Vec<Pid> {
    content
        .split_whitespace()
        .filter_map(|token| match token.parse::<u32>() {
            Ok(pid) => Some(Pid(pid)),
            Err(_) => {
                warn!(job_id = %job_id, value = %token, "Invalid pid in cgroup.procs");
                None
            }
        })
        .collect()
}

/// List subdirectories whose name starts with `prefix`, sorted by name
async fn list_prefixed_dirs(path: &Path, prefix: &str) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(path).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.len() <= prefix.len() || !name.starts_with(prefix) {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push((name, entry.path()));
        }
    }

    dirs.sort();
    Ok(dirs)
}
