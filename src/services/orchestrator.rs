use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        store::{SharedStore, get_json, set_json},
        template::TemplateRenderer,
    },
    error::{DispatchError, DispatchResult, ErrorCode, VendorError},
    models::{
        attempt::DeliveryAttempt,
        message::{OutboundMessage, QueueEnvelope, QueueMessage},
        notification::{MessageContent, Notification, NotificationPayload, SendRequest, SendResponse, StatusReport},
        status::NotificationStatus,
        validation::validate_request,
        vendor::{FailureDiagnostic, SendReceipt, SkipReason, Vendor, VendorDiagnostic},
    },
    services::{
        gateway::QueueGateway,
        selector::{SelectedVendor, Selector},
    },
    utils::backoff_delay,
    vendors::AttemptContext,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delivery rounds before a notification is failed for good.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub status_cache_ttl_seconds: u64,
    pub attempts_ttl_seconds: u64,
    /// How long a worker's claim on a round holds before another worker may
    /// take the round over.
    pub claim_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1000,
            status_cache_ttl_seconds: 3600,
            attempts_ttl_seconds: 86400,
            claim_timeout: Duration::from_secs(30),
        }
    }
}

pub fn record_key(id: &str) -> String {
    format!("notification:record:{}", id)
}

pub fn status_key(id: &str) -> String {
    format!("notification:status:{}", id)
}

pub fn attempts_key(id: &str) -> String {
    format!("notification:attempts:{}", id)
}

pub fn idempotency_key(key: &str) -> String {
    format!("notification:idempotency:{}", key)
}

/// What processing one queue message amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Delivered {
        vendor: Vendor,
        message_id: String,
    },
    Retrying {
        delay: Duration,
    },
    Failed {
        code: ErrorCode,
    },
    /// Redelivered or stale envelope; nothing to do.
    Skipped,
    /// Another worker holds this round; leave the message on the queue.
    InFlight,
}

struct Delivery {
    vendor: Vendor,
    receipt: SendReceipt,
}

/// Owns the notification state machine:
/// `queued -> processing -> delivered | failed`, with `retrying` re-entering
/// the queue after a backoff delay.
pub struct NotificationService {
    store: Arc<dyn SharedStore>,
    gateway: Arc<QueueGateway>,
    selector: Arc<Selector>,
    templates: Arc<dyn TemplateRenderer>,
    config: OrchestratorConfig,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        gateway: Arc<QueueGateway>,
        selector: Arc<Selector>,
        templates: Arc<dyn TemplateRenderer>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            selector,
            templates,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validates, renders and queues a notification. With `immediate` set the
    /// first delivery round runs in-line instead.
    pub async fn send(&self, request: SendRequest) -> DispatchResult<SendResponse> {
        let channel = validate_request(&request.channel, &request.payload)?;
        let payload = self.resolve_content(request.payload).await?;
        let id = Uuid::new_v4().to_string();

        let claimed_key = match request.options.idempotency_key.as_deref() {
            Some(key) => {
                let key = idempotency_key(key);
                if !self.store.compare_and_swap(&key, None, &id).await? {
                    return self.existing_response(&key).await;
                }
                Some(key)
            }
            None => None,
        };

        let notification = Notification::new(id, channel, payload, request.options);
        self.save(&notification).await?;

        info!(
            notification_id = %notification.id,
            channel = %channel,
            tenant = %notification.tenant_id,
            immediate = notification.options.immediate,
            "Notification accepted"
        );

        if notification.options.immediate {
            let id = notification.id.clone();
            let outcome = self.run_round(notification).await?;
            return Ok(Self::response_for(id, outcome));
        }

        if let Err(e) = self.enqueue(&notification, Duration::ZERO, true).await {
            warn!(notification_id = %notification.id, error = %e, "Failed to queue notification");
            self.discard(&notification.id, claimed_key.as_deref()).await;
            return Err(e);
        }

        Ok(SendResponse {
            id: notification.id,
            status: NotificationStatus::Queued.to_string(),
            vendor: None,
            vendor_message_id: None,
        })
    }

    /// Runs one delivery round for a dequeued message. An `Err` means the
    /// message must stay on the queue to be redelivered.
    ///
    /// The round is claimed with a compare-and-swap on the stored record, so
    /// a message whose lease lapsed mid-round is not delivered twice.
    pub async fn process(&self, message: &QueueMessage) -> DispatchResult<ProcessOutcome> {
        let envelope = message.envelope().map_err(|e| {
            DispatchError::InvalidPayload(format!("malformed queue envelope: {}", e))
        })?;

        let key = record_key(&envelope.id);
        let Some(raw) = self.store.get(&key).await? else {
            warn!(notification_id = %envelope.id, "Queued notification has no record, dropping");
            return Ok(ProcessOutcome::Skipped);
        };
        let notification: Notification = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("Corrupt value at {}: {}", key, e))?;

        if notification.status.is_terminal() || envelope.retry_count < notification.retry_count {
            debug!(
                notification_id = %notification.id,
                status = %notification.status,
                envelope_round = envelope.retry_count,
                "Skipping redelivered notification"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        match self.claim(&key, &raw, notification).await? {
            Some(notification) => self.run_round(notification).await,
            None => Ok(ProcessOutcome::InFlight),
        }
    }

    /// Moves the record to `processing` unless another worker holds a live
    /// claim on it. `None` means the claim went elsewhere.
    async fn claim(
        &self,
        key: &str,
        raw: &str,
        mut notification: Notification,
    ) -> DispatchResult<Option<Notification>> {
        let now = Utc::now();

        if notification.status == NotificationStatus::Processing {
            let live = notification.claimed_at.is_some_and(|claimed_at| {
                (now - claimed_at).to_std().unwrap_or_default() < self.config.claim_timeout
            });
            if live {
                debug!(notification_id = %notification.id, "Round already claimed by another worker");
                return Ok(None);
            }
            warn!(notification_id = %notification.id, "Taking over an abandoned delivery round");
        } else {
            notification.transition(NotificationStatus::Processing)?;
        }
        notification.claimed_at = Some(now);

        let claimed = serde_json::to_string(&notification).map_err(Error::from)?;
        if !self.store.compare_and_swap(key, Some(raw), &claimed).await? {
            debug!(notification_id = %notification.id, "Lost the claim race for this round");
            return Ok(None);
        }

        self.cache_status(&StatusReport::from(&notification)).await?;
        Ok(Some(notification))
    }

    pub async fn get_status(&self, id: &str) -> DispatchResult<StatusReport> {
        if let Some(report) = get_json::<StatusReport>(self.store.as_ref(), &status_key(id)).await? {
            return Ok(report);
        }

        let notification = self.load(id).await?.ok_or_else(|| DispatchError::NotFound {
            notification_id: id.to_string(),
        })?;

        let report = StatusReport::from(&notification);
        self.cache_status(&report).await?;
        Ok(report)
    }

    pub async fn get_attempts(&self, id: &str) -> DispatchResult<Vec<DeliveryAttempt>> {
        if self.load(id).await?.is_none() {
            return Err(DispatchError::NotFound {
                notification_id: id.to_string(),
            });
        }

        self.store
            .range(&attempts_key(id))
            .await?
            .iter()
            .map(|raw| {
                serde_json::from_str::<DeliveryAttempt>(raw).map_err(|e| {
                    DispatchError::Internal(anyhow!("Corrupt attempt record for {}: {}", id, e))
                })
            })
            .collect()
    }

    /// Re-queues a failed notification that still has rounds left.
    pub async fn retry(&self, id: &str) -> DispatchResult<StatusReport> {
        let previous = self.load(id).await?.ok_or_else(|| DispatchError::NotFound {
            notification_id: id.to_string(),
        })?;

        if previous.status != NotificationStatus::Failed {
            return Err(DispatchError::InvalidArgument(format!(
                "notification {} is {}, only failed notifications can be retried",
                id, previous.status
            )));
        }

        if previous.retry_count >= self.config.max_retries {
            return Err(DispatchError::MaxRetriesExceeded {
                notification_id: id.to_string(),
                attempts: previous.retry_count,
                max_retries: self.config.max_retries,
            });
        }

        let mut notification = previous.clone();
        notification.transition(NotificationStatus::Queued)?;
        self.save(&notification).await?;

        if let Err(e) = self.enqueue(&notification, Duration::ZERO, false).await {
            self.restore(&previous).await;
            return Err(e);
        }

        info!(notification_id = %id, round = notification.retry_count + 1, "Notification re-queued");
        Ok(StatusReport::from(&notification))
    }

    async fn run_round(&self, mut notification: Notification) -> DispatchResult<ProcessOutcome> {
        if notification.status != NotificationStatus::Processing {
            notification.transition(NotificationStatus::Processing)?;
            self.save(&notification).await?;
        }

        let round = notification.retry_count + 1;
        let result = self.deliver(&notification, round).await;
        notification.retry_count = round;

        match result {
            Ok(delivery) => {
                notification.vendor = Some(delivery.vendor);
                notification.vendor_message_id = Some(delivery.receipt.message_id.clone());
                notification.last_error = None;
                notification.transition(NotificationStatus::Delivered)?;
                self.save(&notification).await?;

                info!(
                    notification_id = %notification.id,
                    vendor = %delivery.vendor,
                    round,
                    "Notification delivered"
                );
                Ok(ProcessOutcome::Delivered {
                    vendor: delivery.vendor,
                    message_id: delivery.receipt.message_id,
                })
            }
            Err(DispatchError::Internal(e)) => Err(DispatchError::Internal(e)),
            Err(failure) => self.settle_failure(notification, failure).await,
        }
    }

    /// `max_retries` counts delivery rounds, not re-queues: a retryable
    /// failure schedules another round only while fewer than `max_retries`
    /// rounds have run. With the defaults that is round 1, a 1 s backoff,
    /// round 2, a 2 s backoff, round 3, then failed. The 4 s delay that would
    /// follow round 3 is never scheduled.
    async fn settle_failure(
        &self,
        mut notification: Notification,
        failure: DispatchError,
    ) -> DispatchResult<ProcessOutcome> {
        let code = failure.code();
        let round = notification.retry_count;

        if code.is_retryable() && round < self.config.max_retries {
            let delay = backoff_delay(self.config.base_backoff_ms, round - 1);
            let previous = notification.clone();

            notification.last_error = Some(failure.diagnostic());
            notification.transition(NotificationStatus::Retrying)?;
            self.save(&notification).await?;

            if let Err(e) = self.enqueue(&notification, delay, false).await {
                self.restore(&previous).await;
                return Err(e);
            }

            warn!(
                notification_id = %notification.id,
                error = %failure,
                round,
                delay_ms = delay.as_millis() as u64,
                "Delivery round failed, retry scheduled"
            );
            return Ok(ProcessOutcome::Retrying { delay });
        }

        let diagnostic = if code.is_retryable() {
            let exhausted = DispatchError::MaxRetriesExceeded {
                notification_id: notification.id.clone(),
                attempts: round,
                max_retries: self.config.max_retries,
            };
            FailureDiagnostic {
                code: exhausted.code(),
                message: format!("{}; last error: {}", exhausted, failure),
                vendors: failure.diagnostic().vendors,
            }
        } else {
            failure.diagnostic()
        };

        error!(
            notification_id = %notification.id,
            code = %diagnostic.code,
            error = %diagnostic.message,
            round,
            "Notification failed"
        );

        let code = diagnostic.code;
        notification.last_error = Some(diagnostic);
        notification.transition(NotificationStatus::Failed)?;
        self.save(&notification).await?;

        Ok(ProcessOutcome::Failed { code })
    }

    /// One delivery round: walks the priority list via the selector until a
    /// vendor accepts the message or the selector has nothing left to offer.
    async fn deliver(&self, notification: &Notification, round: u32) -> DispatchResult<Delivery> {
        let channel = notification.channel;
        let tenant = notification.tenant_id.as_str();

        let mut seen: Vec<Vendor> = Vec::new();
        let mut trail: Vec<VendorDiagnostic> = Vec::new();
        let mut failover_attempt = 0;

        loop {
            let selected = match self.selector.select(channel, tenant, &seen).await {
                Ok(selected) => selected,
                Err(DispatchError::FailoverExhausted { trail: skipped, .. }) => {
                    let skipped: Vec<_> = skipped
                        .into_iter()
                        .filter(|d| d.reason != SkipReason::Excluded)
                        .collect();
                    self.record_skips(notification, round, &skipped).await?;
                    trail.extend(skipped);

                    if trail.is_empty() {
                        self.record_attempt(DeliveryAttempt::failure(
                            &notification.id,
                            None,
                            round,
                            ErrorCode::FailoverExhausted,
                            format!("no vendor configured for {}", channel),
                        ))
                        .await?;
                    }

                    return Err(DispatchError::FailoverExhausted { channel, trail });
                }
                Err(e) => return Err(e),
            };

            self.record_skips(notification, round, &selected.skipped)
                .await?;
            seen.extend(selected.skipped.iter().map(|d| d.vendor));
            trail.extend(selected.skipped.iter().cloned());

            let vendor = selected.vendor();
            match self
                .attempt(notification, &selected, failover_attempt)
                .await
            {
                Ok(receipt) => {
                    self.record_attempt(DeliveryAttempt::success(
                        &notification.id,
                        vendor,
                        round,
                        receipt.vendor_response.clone(),
                    ))
                    .await?;
                    return Ok(Delivery { vendor, receipt });
                }
                Err(e) => {
                    self.record_attempt(DeliveryAttempt::failure(
                        &notification.id,
                        Some(vendor),
                        round,
                        e.code(),
                        e.message.clone(),
                    ))
                    .await?;

                    trail.push(VendorDiagnostic {
                        vendor,
                        breaker: selected.breaker.get_state().await?,
                        reason: SkipReason::SendFailed,
                        detail: Some(e.to_string()),
                    });

                    if !Selector::should_failover(&e) {
                        return Err(DispatchError::DeliveryFailed {
                            notification_id: notification.id.clone(),
                            diagnostic: FailureDiagnostic {
                                code: e.code(),
                                message: e.to_string(),
                                vendors: trail,
                            },
                        });
                    }

                    warn!(
                        notification_id = %notification.id,
                        vendor = %vendor,
                        error = %e,
                        "Vendor send failed, failing over"
                    );
                    seen.push(vendor);
                    failover_attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        notification: &Notification,
        selected: &SelectedVendor,
        failover_attempt: u32,
    ) -> Result<SendReceipt, VendorError> {
        let ctx = AttemptContext {
            channel: notification.channel,
            tenant: &notification.tenant_id,
            failover_attempt,
            breaker: &selected.breaker,
        };

        selected.adapter.send(&notification.payload, &ctx).await
    }

    /// Vendors the selector passed over are logged as implicit failed attempts.
    async fn record_skips(
        &self,
        notification: &Notification,
        round: u32,
        skipped: &[VendorDiagnostic],
    ) -> Result<(), Error> {
        for diagnostic in skipped {
            let code = match diagnostic.reason {
                SkipReason::CircuitOpen => ErrorCode::CircuitOpen,
                _ => ErrorCode::VendorUnavailable,
            };
            let message = match &diagnostic.detail {
                Some(detail) => format!("skipped ({}): {}", diagnostic.reason.as_str(), detail),
                None => format!(
                    "skipped ({}), circuit {}",
                    diagnostic.reason.as_str(),
                    diagnostic.breaker.state.as_str()
                ),
            };

            self.record_attempt(DeliveryAttempt::failure(
                &notification.id,
                Some(diagnostic.vendor),
                round,
                code,
                message,
            ))
            .await?;
        }

        Ok(())
    }

    async fn record_attempt(&self, attempt: DeliveryAttempt) -> Result<(), Error> {
        let raw = serde_json::to_string(&attempt)?;
        self.store
            .push(
                &attempts_key(&attempt.notification_id),
                &raw,
                self.config.attempts_ttl_seconds,
            )
            .await
    }

    async fn resolve_content(
        &self,
        mut payload: NotificationPayload,
    ) -> DispatchResult<NotificationPayload> {
        let Some(template_id) = payload.template_id.as_deref() else {
            return Ok(payload);
        };

        let rendered = self.templates.render(template_id, &payload.context).await?;
        payload.content = Some(MessageContent {
            subject: rendered.subject,
            body: rendered.body,
        });

        Ok(payload)
    }

    /// Initial sends go through the batching buffer; retries carry a delay
    /// and are sent straight away so the delay starts now.
    async fn enqueue(
        &self,
        notification: &Notification,
        delay: Duration,
        buffered: bool,
    ) -> DispatchResult<()> {
        let envelope = QueueEnvelope::for_notification(notification);
        let message = OutboundMessage::from_envelope(&envelope, delay).map_err(Error::from)?;

        if buffered {
            self.gateway.send_message(message).await
        } else {
            self.gateway.send_batch(vec![message]).await.map(|_| ())
        }
    }

    async fn existing_response(&self, claimed_key: &str) -> DispatchResult<SendResponse> {
        let id = self
            .store
            .get(claimed_key)
            .await?
            .ok_or_else(|| anyhow!("Idempotency key {} vanished", claimed_key))?;

        debug!(notification_id = %id, "Duplicate send, returning existing notification");

        Ok(match self.load(&id).await? {
            Some(existing) => SendResponse {
                status: existing.status.to_string(),
                vendor: existing.vendor,
                vendor_message_id: existing.vendor_message_id,
                id,
            },
            None => SendResponse {
                id,
                status: NotificationStatus::Queued.to_string(),
                vendor: None,
                vendor_message_id: None,
            },
        })
    }

    fn response_for(id: String, outcome: ProcessOutcome) -> SendResponse {
        let (status, vendor, vendor_message_id) = match outcome {
            ProcessOutcome::Delivered { vendor, message_id } => {
                ("sent".to_string(), Some(vendor), Some(message_id))
            }
            ProcessOutcome::Retrying { .. } => (NotificationStatus::Retrying.to_string(), None, None),
            ProcessOutcome::Failed { .. } => (NotificationStatus::Failed.to_string(), None, None),
            ProcessOutcome::Skipped | ProcessOutcome::InFlight => {
                (NotificationStatus::Queued.to_string(), None, None)
            }
        };

        SendResponse {
            id,
            status,
            vendor,
            vendor_message_id,
        }
    }

    async fn load(&self, id: &str) -> Result<Option<Notification>, Error> {
        get_json(self.store.as_ref(), &record_key(id)).await
    }

    async fn save(&self, notification: &Notification) -> Result<(), Error> {
        set_json(self.store.as_ref(), &record_key(&notification.id), notification, None).await?;
        self.cache_status(&StatusReport::from(notification)).await
    }

    async fn cache_status(&self, report: &StatusReport) -> Result<(), Error> {
        set_json(
            self.store.as_ref(),
            &status_key(&report.id),
            report,
            Some(self.config.status_cache_ttl_seconds),
        )
        .await
    }

    async fn restore(&self, previous: &Notification) {
        if let Err(e) = self.save(previous).await {
            error!(notification_id = %previous.id, error = %e, "Failed to restore notification state");
        }
    }

    async fn discard(&self, id: &str, claimed_key: Option<&str>) {
        let mut keys = vec![record_key(id), status_key(id)];
        keys.extend(claimed_key.map(str::to_string));

        for key in keys {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to clean up unsent notification");
            }
        }
    }
}
