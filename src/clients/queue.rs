use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::{
    sync::{Mutex, Notify},
    time::{Instant, sleep_until},
};
use uuid::Uuid;

use crate::models::message::{DlqMessage, OutboundMessage, QueueMessage};

/// Durable at-least-once queue with per-message visibility leases.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueues up to one batch of messages and returns their ids.
    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> Result<Vec<String>, Error>;

    /// Long-polls for up to `max` visible messages for at most `wait`. Each
    /// returned message stays invisible to other consumers for
    /// `visibility_timeout` unless deleted first.
    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, Error>;

    /// Acknowledges a message. Returns false when the receipt is no longer
    /// valid, e.g. because the lease lapsed and someone else received it.
    async fn delete(&self, receipt_handle: &str) -> Result<bool, Error>;

    /// Moves a received message to the dead-letter destination.
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error>;
}

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<DlqMessage>,
    batch_sizes: Vec<usize>,
}

/// Process-local queue with the same lease semantics as the durable backends.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DlqMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Sizes of every batch handed to `send_batch`, in order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }

    /// Bodies of every pending message with the delay left before it becomes visible.
    pub async fn pending(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        self.state
            .lock()
            .await
            .messages
            .iter()
            .map(|m| (m.body.clone(), m.visible_at.saturating_duration_since(now)))
            .collect()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> Result<Vec<String>, Error> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state.batch_sizes.push(messages.len());
        let ids = messages.iter().map(|m| m.id.clone()).collect();

        state
            .messages
            .extend(messages.into_iter().map(|m| StoredMessage {
                id: m.id,
                body: m.body,
                attributes: m.attributes,
                visible_at: now + m.delay,
                receive_count: 0,
                receipt: None,
            }));

        drop(state);
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, Error> {
        let deadline = Instant::now() + wait;

        loop {
            let mut state = self.state.lock().await;
            let notified = self.notify.notified();
            let now = Instant::now();

            let mut received = Vec::new();
            for message in state.messages.iter_mut() {
                if received.len() >= max {
                    break;
                }
                if message.visible_at > now {
                    continue;
                }

                let receipt = Uuid::new_v4().to_string();
                message.receive_count += 1;
                message.visible_at = now + visibility_timeout;
                message.receipt = Some(receipt.clone());

                received.push(QueueMessage {
                    id: message.id.clone(),
                    body: message.body.clone(),
                    receipt_handle: receipt,
                    receive_count: message.receive_count,
                    attributes: message.attributes.clone(),
                });
            }

            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }

            let wake = state
                .messages
                .iter()
                .map(|m| m.visible_at)
                .min()
                .map_or(deadline, |at| at.min(deadline));
            drop(state);

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let position = state.messages.iter().position(|m| {
            m.receipt.as_deref() == Some(receipt_handle) && m.visible_at > now
        });

        Ok(match position {
            Some(index) => {
                state.messages.remove(index);
                true
            }
            None => false,
        })
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        let index = state
            .messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(message.receipt_handle.as_str()))
            .ok_or_else(|| anyhow!("Message {} is not leased by this receipt", message.id))?;
        let stored = state.messages.remove(index);

        state.dead_letters.push(DlqMessage {
            message_id: stored.id,
            original_body: stored.body,
            receive_count: stored.receive_count,
            failure_reason: reason.to_string(),
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}
