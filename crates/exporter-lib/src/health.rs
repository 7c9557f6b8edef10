//! Health tracking for the exporter
//!
//! Each stage of the collection cycle reports its status after every cycle,
//! so a broken data source shows up on `/healthz` and not only as zeroed
//! series. Readiness follows the published snapshot: the exporter is ready
//! once a cycle has committed and while no stage is failing outright.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing, but cycles still commit with this input zeroed
    Degraded,
    /// Cycles cannot commit
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Cycles in a row this component has reported a failure
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_committed_cycle: Option<u64>,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Stages of the collection cycle that report health
pub mod components {
    pub const HIERARCHY_WALKER: &str = "hierarchy_walker";
    pub const SCHEDULER_SOURCE: &str = "scheduler_source";
    pub const DEVICE_SOURCE: &str = "device_source";
    pub const PUBLISHER: &str = "publisher";

    pub const ALL: [&str; 4] = [HIERARCHY_WALKER, SCHEDULER_SOURCE, DEVICE_SOURCE, PUBLISHER];
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    last_committed_cycle: Option<u64>,
}

impl HealthState {
    fn status(&self) -> ComponentStatus {
        self.components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Shared health state written by the collection loop and read by the API
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy before its first report
    pub async fn register(&self, name: &str) {
        let mut state = self.state.write().await;
        state
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth {
                status: ComponentStatus::Healthy,
                message: None,
                consecutive_failures: 0,
                last_check_timestamp: chrono::Utc::now().timestamp(),
            });
    }

    pub async fn set_healthy(&self, name: &str) {
        self.record(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn record(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        let consecutive_failures = match status {
            ComponentStatus::Healthy => 0,
            _ => {
                state
                    .components
                    .get(name)
                    .map_or(0, |c| c.consecutive_failures)
                    + 1
            }
        };

        state.components.insert(
            name.to_string(),
            ComponentHealth {
                status,
                message,
                consecutive_failures,
                last_check_timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Note that `cycle` committed a snapshot
    pub async fn mark_committed(&self, cycle: u64) {
        self.state.write().await.last_committed_cycle = Some(cycle);
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: state.status(),
            last_committed_cycle: state.last_committed_cycle,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;

        let reason = if state.last_committed_cycle.is_none() {
            Some("No metrics snapshot committed yet".to_string())
        } else if state.status() == ComponentStatus::Unhealthy {
            let failing: Vec<&str> = state
                .components
                .iter()
                .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| name.as_str())
                .collect();
            Some(format!("Snapshot is stale: {} failing", failing.join(", ")))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered() -> HealthRegistry {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_registered_components_start_healthy() {
        let health = registered().await.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 4);
        assert!(health.last_committed_cycle.is_none());
        assert!(health
            .components
            .values()
            .all(|c| c.status == ComponentStatus::Healthy && c.consecutive_failures == 0));
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = registered().await;

        registry
            .set_degraded(components::SCHEDULER_SOURCE, "squeue timed out")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::HIERARCHY_WALKER, "cgroup root unreadable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_failure_streak_resets_on_recovery() {
        let registry = registered().await;

        registry
            .set_degraded(components::DEVICE_SOURCE, "nvidia-smi not found")
            .await;
        registry
            .set_degraded(components::DEVICE_SOURCE, "nvidia-smi not found")
            .await;
        let health = registry.health().await;
        assert_eq!(health.components[components::DEVICE_SOURCE].consecutive_failures, 2);
        assert_eq!(
            health.components[components::DEVICE_SOURCE].message.as_deref(),
            Some("nvidia-smi not found")
        );

        registry.set_healthy(components::DEVICE_SOURCE).await;
        let health = registry.health().await;
        assert_eq!(health.components[components::DEVICE_SOURCE].consecutive_failures, 0);
        assert!(health.components[components::DEVICE_SOURCE].message.is_none());
    }

    #[tokio::test]
    async fn test_register_keeps_reported_status() {
        let registry = HealthRegistry::new();
        registry
            .set_degraded(components::SCHEDULER_SOURCE, "squeue timed out")
            .await;
        registry.register(components::SCHEDULER_SOURCE).await;

        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_not_ready_before_first_commit() {
        let readiness = registered().await.readiness().await;

        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("No metrics snapshot committed yet")
        );
    }

    #[tokio::test]
    async fn test_ready_after_commit_even_when_degraded() {
        let registry = registered().await;
        registry.mark_committed(1).await;
        registry
            .set_degraded(components::SCHEDULER_SOURCE, "squeue timed out")
            .await;

        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.reason.is_none());
        assert_eq!(registry.health().await.last_committed_cycle, Some(1));
    }

    #[tokio::test]
    async fn test_unhealthy_walker_is_not_ready() {
        let registry = registered().await;
        registry.mark_committed(3).await;
        registry
            .set_unhealthy(components::HIERARCHY_WALKER, "cgroup root unreadable")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains(components::HIERARCHY_WALKER));
    }
}
