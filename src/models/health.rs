use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::vendor::{HealthReport, Vendor};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: HashMap<String, ServiceHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            circuit_breaker: None,
            error: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            circuit_breaker: None,
            error: Some(error),
        }
    }

    pub fn degraded(error: String) -> Self {
        Self {
            status: HealthStatus::Degraded,
            response_time_ms: None,
            circuit_breaker: None,
            error: Some(error),
        }
    }

    pub fn with_circuit_breaker(mut self, state: String) -> Self {
        self.circuit_breaker = Some(state);
        self
    }
}

/// Cached health signal for one (vendor, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorHealthRecord {
    pub vendor: Vendor,
    pub is_healthy: bool,
    pub success_rate: f64,
    pub latency_ms: u64,
    pub last_check: DateTime<Utc>,

    #[serde(default)]
    pub diagnostics: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl VendorHealthRecord {
    pub fn from_report(vendor: Vendor, report: HealthReport, success_rate: f64) -> Self {
        Self {
            vendor,
            is_healthy: report.is_healthy,
            success_rate,
            latency_ms: report.latency_ms,
            last_check: Utc::now(),
            diagnostics: report.diagnostics,
            last_error: report.last_error,
        }
    }

    pub fn is_fresh(&self, max_age: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_check);
        age.num_milliseconds() < max_age.as_millis() as i64
    }
}
