//! Component health behind the liveness and readiness endpoints
//!
//! Components report the outcome of each external call. A single failure
//! marks the component degraded; a run of consecutive failures marks it
//! unhealthy, which also takes the process out of readiness. Any success
//! resets the run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures after which a component is reported unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None, 0)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(
            ComponentStatus::Unhealthy,
            Some(message.into()),
            UNHEALTHY_AFTER_FAILURES,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, s| match (worst, s) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const CONTROLLER: &str = "controller";
    pub const METRICS_PROVIDER: &str = "metrics_provider";
    pub const KUBE_API: &str = "kube_api";
}

#[derive(Debug, Default)]
struct State {
    components: BTreeMap<String, ComponentHealth>,
    initialized: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn record_success(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut state = self.state.write().await;
        let failures = state
            .components
            .get(name)
            .map_or(0, |c| c.consecutive_failures)
            .saturating_add(1);
        let status = if failures >= UNHEALTHY_AFTER_FAILURES {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        state.components.insert(
            name.to_string(),
            ComponentHealth::new(status, Some(message.into()), failures),
        );
    }

    /// Report the outcome of one call against a component
    pub async fn record<T, E: std::fmt::Display>(&self, name: &str, outcome: &Result<T, E>) {
        match outcome {
            Ok(_) => self.record_success(name).await,
            Err(e) => self.record_failure(name, e.to_string()).await,
        }
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::unhealthy(message));
    }

    pub async fn set_initialized(&self, initialized: bool) {
        self.state.write().await.initialized = initialized;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let initialized = self.state.read().await.initialized;
        let health = self.health().await;

        let reason = if !initialized {
            Some("Controller not yet initialized".to_string())
        } else if !health.status.is_operational() {
            let failing: Vec<&str> = health
                .components
                .iter()
                .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| name.as_str())
                .collect();
            Some(format!("Unhealthy components: {}", failing.join(", ")))
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

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_failures_escalate_to_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::METRICS_PROVIDER).await;

        registry
            .record_failure(components::METRICS_PROVIDER, "timeout")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        for _ in 1..UNHEALTHY_AFTER_FAILURES {
            registry
                .record_failure(components::METRICS_PROVIDER, "timeout")
                .await;
        }
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components[components::METRICS_PROVIDER].consecutive_failures,
            UNHEALTHY_AFTER_FAILURES
        );
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let registry = HealthRegistry::new();
        let failed: Result<(), String> = Err("boom".to_string());
        registry.record(components::KUBE_API, &failed).await;
        registry.record(components::KUBE_API, &failed).await;
        registry.record(components::KUBE_API, &Ok::<(), String>(())).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components[components::KUBE_API].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_not_ready_until_initialized() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;
        assert!(!registry.readiness().await.ready);

        registry.set_initialized(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_component_unhealthy() {
        let registry = HealthRegistry::new();
        registry.set_initialized(true).await;
        registry.set_unhealthy(components::KUBE_API, "forbidden").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Unhealthy components: kube_api"));
    }
}
