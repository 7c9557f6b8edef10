//! Job metrics exporter library
//!
//! This crate provides the core functionality for:
//! - Discovering live Slurm jobs and their processes from the cgroup tree
//! - Attributing GPU memory, GPU requests and block I/O to those jobs
//! - Publishing consistent snapshots with stale series zeroed
//! - Health checks, self metrics and the HTTP scrape endpoint

pub mod api;
pub mod collector;
pub mod health;
pub mod models;
pub mod observability;
pub mod publisher;
pub mod sources;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
pub use publisher::{Snapshot, SnapshotHandle};
