use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::DispatchError,
    models::{
        status::NotificationStatus,
        vendor::{FailureDiagnostic, Vendor},
    },
};

pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "push" => Ok(Channel::Push),
            _ => Err(DispatchError::InvalidChannel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

/// Recipient plus either literal content or a template reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub recipient: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Deliver in-line instead of going through the queue.
    #[serde(default)]
    pub immediate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Repeated sends with the same key return the first notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SendOptions {
    pub fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or(DEFAULT_TENANT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub channel: String,
    pub payload: NotificationPayload,

    #[serde(default)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub id: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Vendor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub channel: Channel,
    pub tenant_id: String,
    pub payload: NotificationPayload,
    pub options: SendOptions,
    pub status: NotificationStatus,

    /// Completed delivery rounds.
    pub retry_count: u32,

    pub vendor: Option<Vendor>,
    pub vendor_message_id: Option<String>,
    pub last_error: Option<FailureDiagnostic>,

    /// When a worker last claimed the current round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        id: String,
        channel: Channel,
        payload: NotificationPayload,
        options: SendOptions,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            channel,
            tenant_id: options.tenant().to_string(),
            payload,
            options,
            status: NotificationStatus::Queued,
            retry_count: 0,
            vendor: None,
            vendor_message_id: None,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: NotificationStatus) -> Result<(), DispatchError> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidArgument(format!(
                "notification {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Caller-visible view of a notification, also the cached status value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: String,
    pub status: NotificationStatus,
    pub channel: Channel,
    pub tenant_id: String,
    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Vendor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureDiagnostic>,

    pub updated_at: DateTime<Utc>,
}

impl From<&Notification> for StatusReport {
    fn from(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            status: notification.status,
            channel: notification.channel,
            tenant_id: notification.tenant_id.clone(),
            attempts: notification.retry_count,
            vendor: notification.vendor,
            vendor_message_id: notification.vendor_message_id.clone(),
            last_error: notification.last_error.clone(),
            updated_at: notification.updated_at,
        }
    }
}
