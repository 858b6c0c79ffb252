use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of a telemetry service.
///
/// Every loop that must be running for the process to be trusted with device
/// data (rdkafka clients, consumers, the MQTT subscriber, janitor cleaners)
/// registers a component with a deadline, and reports healthy more often than
/// that deadline. The process status combines all components according to the
/// registry's `HealthStrategy`:
///   - `All`: every component must be healthy, and at least one registered
///   - `Any`: one healthy component is enough
///
/// A component that misses its deadline is reported as `Stalled`.
///
/// Handles write straight into the shared map, so reporting works from both
/// async code and the synchronous rdkafka callbacks.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status, as computed by the registry strategy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered
    Starting,
    /// Recently reported healthy, must report again before the instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// Set at read time when the HealthyUntil deadline is reached
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy_at(&self, now: Instant) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > now)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthStrategy {
    All,
    Any,
}

impl std::str::FromStr for HealthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "all" => Ok(HealthStrategy::All),
            "any" => Ok(HealthStrategy::Any),
            _ => Err(format!("unknown health strategy: {s}, must be ALL or ANY")),
        }
    }
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub async fn report_healthy(&self) {
        self.report_healthy_blocking()
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        self.report_status_blocking(status)
    }

    /// Same as `report_healthy`, callable from synchronous contexts such as
    /// `rdkafka::ClientContext::stats`.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            Instant::now() + self.deadline,
        ))
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: probes will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock, dropping status of {}", self.component),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    strategy: HealthStrategy,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self::new_with_strategy(name, HealthStrategy::All)
    }

    pub fn new_with_strategy(name: &str, strategy: HealthStrategy) -> Self {
        Self {
            name: name.to_owned(),
            strategy,
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting` state. The returned handle should be
    /// passed to the component so it can report on a schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall process status, usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let now = Instant::now();
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let mut status = HealthStatus {
            healthy: false,
            components: HashMap::with_capacity(components.len()),
        };
        let mut healthy_count = 0;
        for (name, component) in components.iter() {
            let shown = match component {
                ComponentStatus::HealthyUntil(_) if component.is_healthy_at(now) => {
                    healthy_count += 1;
                    component.clone()
                }
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            status.components.insert(name.clone(), shown);
        }

        status.healthy = match self.strategy {
            HealthStrategy::All => !components.is_empty() && healthy_count == components.len(),
            HealthStrategy::Any => healthy_count > 0,
        };

        match status.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("consumer".to_string(), Duration::from_secs(30))
            .await;

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                Instant::now() - Duration::from_secs(1),
            ))
            .await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("rdkafka"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn all_strategy_needs_every_component() {
        let registry = HealthRegistry::new("liveness");
        let one = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let two = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;

        one.report_healthy().await;
        assert!(!registry.get_status().healthy);

        two.report_healthy_blocking();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy).await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn any_strategy_needs_one_component() {
        let registry = HealthRegistry::new_with_strategy("liveness", HealthStrategy::Any);
        let one = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let _two = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;
        assert!(!registry.get_status().healthy);

        one.report_healthy().await;
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!("ALL".parse::<HealthStrategy>(), Ok(HealthStrategy::All));
        assert_eq!(" any ".parse::<HealthStrategy>(), Ok(HealthStrategy::Any));
        assert!("most".parse::<HealthStrategy>().is_err());
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
