//! Resource attribution engine
//!
//! This module correlates the Slurm cgroup hierarchy, the scheduler queue
//! and the GPU process table into one per-job snapshot per cycle:
//! - `hierarchy` walks the cgroup tree (the source of truth for live jobs)
//! - `devices` attributes GPU memory and GPU requests to those jobs
//! - `io` reads per-process block I/O counters
//! - `loop` sequences the above and commits through the publisher

mod devices;
mod hierarchy;
mod io;
mod r#loop;

#[cfg(test)]
mod tests;

pub use devices::{CorrelationReport, DeviceCorrelator};
pub use hierarchy::{parse_procs, HierarchyWalker, WalkError};
pub use io::{parse_io, IoAggregator};
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder, CycleError};
