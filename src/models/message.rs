use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::models::{
    notification::{Channel, Notification, NotificationPayload, SendOptions},
    status::NotificationStatus,
};

pub const ATTR_STATUS: &str = "status";
pub const ATTR_ENQUEUED_AT: &str = "enqueued_at";

/// Body of every message on the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub id: String,
    pub payload: NotificationPayload,
    pub channel: Channel,

    #[serde(default)]
    pub options: SendOptions,

    pub tenant_id: String,
    pub timestamp: i64,
    pub status: NotificationStatus,
    pub retry_count: u32,
}

impl QueueEnvelope {
    pub fn for_notification(notification: &Notification) -> Self {
        Self {
            id: notification.id.clone(),
            payload: notification.payload.clone(),
            channel: notification.channel,
            options: notification.options.clone(),
            tenant_id: notification.tenant_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            status: NotificationStatus::Queued,
            retry_count: notification.retry_count,
        }
    }
}

/// A message waiting to be handed to the queue backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: String,
    pub body: String,
    pub delay: Duration,
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn from_envelope(envelope: &QueueEnvelope, delay: Duration) -> Result<Self, serde_json::Error> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_STATUS.to_string(), envelope.status.to_string());
        attributes.insert(ATTR_ENQUEUED_AT.to_string(), envelope.timestamp.to_string());

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            body: serde_json::to_string(envelope)?,
            delay,
            attributes,
        })
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay.as_secs()
    }
}

/// A message handed out by the queue backend, invisible to other consumers
/// until deleted or until its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: u32,
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    pub fn envelope(&self) -> Result<QueueEnvelope, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub message_id: String,
    pub original_body: String,
    pub receive_count: u32,
    pub failure_reason: String,
    pub failed_at: String,
}
