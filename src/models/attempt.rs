use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ErrorCode, models::vendor::Vendor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One try to deliver a notification through one vendor. `vendor` is `None`
/// when no vendor could be selected at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub notification_id: String,
    pub vendor: Option<Vendor>,
    pub outcome: AttemptOutcome,

    /// Delivery round this attempt belongs to.
    pub round: u32,

    #[serde(default)]
    pub vendor_response: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub attempted_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn success(
        notification_id: &str,
        vendor: Vendor,
        round: u32,
        vendor_response: serde_json::Value,
    ) -> Self {
        Self {
            notification_id: notification_id.to_string(),
            vendor: Some(vendor),
            outcome: AttemptOutcome::Success,
            round,
            vendor_response,
            error: None,
            error_message: None,
            attempted_at: Utc::now(),
        }
    }

    pub fn failure(
        notification_id: &str,
        vendor: Option<Vendor>,
        round: u32,
        error: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: notification_id.to_string(),
            vendor,
            outcome: AttemptOutcome::Failure,
            round,
            vendor_response: serde_json::Value::Null,
            error: Some(error),
            error_message: Some(message.into()),
            attempted_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}
