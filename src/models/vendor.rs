use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DispatchError, ErrorCode},
    models::{circuit_breaker::BreakerSnapshot, notification::Channel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Iterable,
    SendGrid,
    Ses,
    Telnyx,
    Twilio,
    Sns,
}

impl Vendor {
    pub const ALL: [Vendor; 6] = [
        Vendor::Iterable,
        Vendor::SendGrid,
        Vendor::Ses,
        Vendor::Telnyx,
        Vendor::Twilio,
        Vendor::Sns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Iterable => "iterable",
            Vendor::SendGrid => "sendgrid",
            Vendor::Ses => "ses",
            Vendor::Telnyx => "telnyx",
            Vendor::Twilio => "twilio",
            Vendor::Sns => "sns",
        }
    }

    /// Prefix of the environment variables holding this vendor's settings.
    pub fn env_prefix(&self) -> String {
        format!("{}_", self.as_str().to_ascii_uppercase())
    }

    pub fn supports(&self, channel: Channel) -> bool {
        match self {
            Vendor::Iterable => matches!(channel, Channel::Email | Channel::Push),
            Vendor::SendGrid | Vendor::Ses => channel == Channel::Email,
            Vendor::Telnyx | Vendor::Twilio => channel == Channel::Sms,
            Vendor::Sns => matches!(channel, Channel::Sms | Channel::Push),
        }
    }
}

impl Display for Vendor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str() == needle)
            .ok_or_else(|| DispatchError::InvalidArgument(format!("unknown vendor '{}'", s)))
    }
}

/// Vendor-independent delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub status: String,
    pub vendor_response: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorStatus {
    pub state: DeliveryState,
    pub native_state: Option<String>,
    pub timestamps: HashMap<String, DateTime<Utc>>,
    pub vendor_metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub latency_ms: u64,
    pub diagnostics: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthReport {
    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            latency_ms,
            diagnostics: serde_json::Value::Null,
            last_error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    Unhealthy,
    SendFailed,
    Excluded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::Unhealthy => "unhealthy",
            SkipReason::SendFailed => "send_failed",
            SkipReason::Excluded => "excluded",
        }
    }
}

/// Why one vendor was not used, with its breaker state at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorDiagnostic {
    pub vendor: Vendor,
    pub breaker: BreakerSnapshot,
    pub reason: SkipReason,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDiagnostic {
    pub code: ErrorCode,
    pub message: String,

    #[serde(default)]
    pub vendors: Vec<VendorDiagnostic>,
}
