use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{
        circuit_breaker::{BreakerRegistry, CircuitBreaker},
        store::SharedStore,
        template::template_breaker_key,
    },
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
        notification::{Channel, DEFAULT_TENANT},
        vendor::Vendor,
    },
    services::{gateway::QueueGateway, monitor::HealthMonitor},
    vendors::registry::VendorRegistry,
};

const CRITICAL_CHECKS: [&str; 2] = ["cache_service", "message_broker"];

pub struct HealthChecker {
    store: Arc<dyn SharedStore>,
    gateway: Arc<QueueGateway>,
    breakers: BreakerRegistry,
    registry: Arc<VendorRegistry>,
    monitor: Arc<HealthMonitor>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        gateway: Arc<QueueGateway>,
        breakers: BreakerRegistry,
        registry: Arc<VendorRegistry>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            gateway,
            breakers,
            registry,
            monitor,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("cache_service".to_string(), self.check_store().await);
        checks.insert("message_broker".to_string(), self.check_queue().await);

        let template_breaker = self.breakers.breaker(template_breaker_key());
        checks.insert(
            "template_service".to_string(),
            Self::check_circuit_breaker(&template_breaker).await,
        );

        for channel in Channel::ALL {
            for &vendor in self.registry.priorities(channel) {
                if self.registry.adapter(vendor).is_none() {
                    continue;
                }
                checks.insert(
                    format!("vendor:{}:{}", vendor, channel),
                    self.check_vendor(vendor, channel).await,
                );
            }
        }

        let overall_status = Self::determine_overall_status(&checks);

        HealthCheckResponse {
            status: overall_status,
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
        }
    }

    async fn check_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.store.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Store ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_queue(&self) -> ServiceHealth {
        let start = Instant::now();

        let health = match self.gateway.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Queue health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Queue backend ping failed");
                return ServiceHealth::unhealthy(format!("Ping failed: {}", e));
            }
        };

        let breaker = self.breakers.breaker(self.gateway.breaker_key().clone());
        match breaker.get_state().await {
            Ok(snapshot) if snapshot.state != CircuitState::Closed => {
                ServiceHealth::degraded("Queue circuit breaker is not closed".to_string())
                    .with_circuit_breaker(snapshot.state.as_str().to_string())
            }
            Ok(snapshot) => health.with_circuit_breaker(snapshot.state.as_str().to_string()),
            Err(e) => {
                warn!(error = %e, "Failed to check queue circuit breaker state");
                health
            }
        }
    }

    async fn check_vendor(&self, vendor: Vendor, channel: Channel) -> ServiceHealth {
        let breaker = self.breakers.for_vendor(vendor, channel, DEFAULT_TENANT);
        let breaker_health = Self::check_circuit_breaker(&breaker).await;
        if breaker_health.status != HealthStatus::Healthy {
            return breaker_health;
        }

        match self.monitor.cached(channel, vendor).await {
            Ok(Some(record)) if !record.is_healthy => ServiceHealth::degraded(
                record
                    .last_error
                    .unwrap_or_else(|| "Vendor reported unhealthy".to_string()),
            )
            .with_circuit_breaker(CircuitState::Closed.as_str().to_string()),
            Ok(Some(record)) => ServiceHealth::healthy(record.latency_ms)
                .with_circuit_breaker(CircuitState::Closed.as_str().to_string()),
            Ok(None) => breaker_health,
            Err(e) => {
                warn!(vendor = %vendor, channel = %channel, error = %e, "Failed to read vendor health");
                breaker_health
            }
        }
    }

    async fn check_circuit_breaker(breaker: &CircuitBreaker) -> ServiceHealth {
        match breaker.get_state().await {
            Ok(snapshot) => {
                let state_str = snapshot.state.as_str().to_string();
                debug!(
                    component = %breaker.key().component(),
                    circuit_state = %state_str,
                    "Circuit breaker state checked"
                );

                match snapshot.state {
                    CircuitState::Closed => {
                        ServiceHealth::healthy(0).with_circuit_breaker(state_str)
                    }
                    CircuitState::HalfOpen => {
                        ServiceHealth::degraded("Circuit breaker in recovery mode".to_string())
                            .with_circuit_breaker(state_str)
                    }
                    CircuitState::Open => ServiceHealth::degraded(format!(
                        "Circuit breaker open after {} consecutive failures",
                        snapshot.consecutive_failures
                    ))
                    .with_circuit_breaker(state_str),
                }
            }
            Err(e) => {
                warn!(
                    component = %breaker.key().component(),
                    error = %e,
                    "Failed to check circuit breaker state"
                );
                ServiceHealth::unhealthy(format!("Cannot check circuit breaker: {}", e))
            }
        }
    }

    /// Unhealthy if the store or queue is down, degraded if anything else is
    /// not fully healthy.
    pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
        let critical_unhealthy = checks
            .iter()
            .filter(|(name, _)| CRITICAL_CHECKS.contains(&name.as_str()))
            .any(|(_, health)| health.status == HealthStatus::Unhealthy);

        let has_unhealthy_or_degraded = checks
            .values()
            .any(|health| health.status != HealthStatus::Healthy);

        if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if has_unhealthy_or_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_failure_makes_service_unhealthy() {
        let mut checks = HashMap::new();
        checks.insert("cache_service".to_string(), ServiceHealth::healthy(1));
        checks.insert(
            "message_broker".to_string(),
            ServiceHealth::unhealthy("down".to_string()),
        );

        assert_eq!(
            HealthChecker::determine_overall_status(&checks),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn vendor_trouble_only_degrades() {
        let mut checks = HashMap::new();
        checks.insert("cache_service".to_string(), ServiceHealth::healthy(1));
        checks.insert("message_broker".to_string(), ServiceHealth::healthy(1));
        checks.insert(
            "vendor:sendgrid:email".to_string(),
            ServiceHealth::degraded("open".to_string()),
        );

        assert_eq!(
            HealthChecker::determine_overall_status(&checks),
            HealthStatus::Degraded
        );
    }
}
