use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Identity of one breaker: `circuit:{vendor}:{channel}:{tenant}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub vendor: String,
    pub channel: String,
    pub tenant: String,
}

impl BreakerKey {
    pub fn new(
        vendor: impl Into<String>,
        channel: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            channel: channel.into(),
            tenant: tenant.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("circuit:{}:{}:{}", self.vendor, self.channel, self.tenant)
    }

    pub fn component(&self) -> String {
        format!("{}/{}/{}", self.vendor, self.channel, self.tenant)
    }
}

/// Persisted breaker state. Timestamps are unix milliseconds so every worker
/// evaluates cooldowns against the same wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_started_at: Option<i64>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
            trial_started_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<i64>,
}

impl From<&BreakerRecord> for BreakerSnapshot {
    fn from(record: &BreakerRecord) -> Self {
        Self {
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            opened_at: record.opened_at,
        }
    }
}
