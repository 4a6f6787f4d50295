use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use dispatch_service::{
    clients::{queue::QueueBackend, store::SharedStore},
    error::{DispatchError, ErrorCode, VendorErrorKind},
    models::{
        attempt::AttemptOutcome,
        circuit_breaker::CircuitState,
        message::{QueueEnvelope, QueueMessage},
        notification::{Channel, Notification, NotificationPayload, SendOptions, SendRequest},
        status::NotificationStatus,
        vendor::{SkipReason, Vendor},
    },
    services::{
        orchestrator::{ProcessOutcome, record_key, status_key},
        worker::{Worker, WorkerConfig},
    },
    utils::backoff_delay,
    vendors::registry::VendorRegistry,
};
use serde_json::json;
use tokio::sync::watch;
use tokio_test::assert_ok;

use crate::common::{Harness, StubAdapter, email_request, registry_with};

fn email_harness() -> (Harness, Vec<Arc<StubAdapter>>) {
    let stubs = vec![
        StubAdapter::healthy(Vendor::Iterable),
        StubAdapter::healthy(Vendor::SendGrid),
        StubAdapter::healthy(Vendor::Ses),
    ];
    (Harness::new(registry_with(&stubs)), stubs)
}

/// Receives one message, processes it and acknowledges it.
async fn process_next(harness: &Harness, wait: Duration) -> Result<ProcessOutcome> {
    let mut messages = harness.gateway.receive_messages(1, wait).await?;
    assert_eq!(messages.len(), 1, "Expected a queued message");
    let message = messages.remove(0);

    let outcome = harness.service.process(&message).await?;
    assert!(harness.gateway.delete_message(&message.receipt_handle).await?);
    Ok(outcome)
}

/// Test: Immediate email through a healthy primary reports sent via iterable
#[tokio::test]
async fn test_immediate_send_uses_primary() -> Result<()> {
    let (harness, stubs) = email_harness();

    let response = harness.service.send(email_request(true)).await?;

    assert_eq!(response.status, "sent");
    assert_eq!(response.vendor, Some(Vendor::Iterable));
    assert_eq!(response.vendor_message_id.as_deref(), Some("iterable-msg-1"));
    assert_eq!(stubs[0].sends(), 1);

    let status = harness.service.get_status(&response.id).await?;
    assert_eq!(status.status, NotificationStatus::Delivered);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.vendor, Some(Vendor::Iterable));

    let attempts = harness.service.get_attempts(&response.id).await?;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].is_success());

    Ok(())
}

/// Test: With the primary circuit open delivery goes through the secondary and
/// the skip is logged as an implicit failed attempt
#[tokio::test]
async fn test_open_primary_delivers_through_secondary() -> Result<()> {
    let (harness, stubs) = email_harness();
    harness.open_breaker(Vendor::Iterable, Channel::Email).await;

    let start = std::time::Instant::now();
    let response = harness.service.send(email_request(true)).await?;
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(response.status, "sent");
    assert_eq!(response.vendor, Some(Vendor::SendGrid));
    assert_eq!(stubs[0].sends(), 0, "Open circuit must not be called");

    let attempts = harness.service.get_attempts(&response.id).await?;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].vendor, Some(Vendor::Iterable));
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(attempts[0].error, Some(ErrorCode::CircuitOpen));
    assert_eq!(attempts[1].vendor, Some(Vendor::SendGrid));
    assert!(attempts[1].is_success());

    Ok(())
}

/// Test: A failing vendor mid-round fails over to the next one
#[tokio::test]
async fn test_send_failure_fails_over() -> Result<()> {
    let stubs = vec![
        StubAdapter::failing(Vendor::Iterable, VendorErrorKind::RateLimited),
        StubAdapter::healthy(Vendor::SendGrid),
    ];
    let harness = Harness::new(registry_with(&stubs));

    let response = harness.service.send(email_request(true)).await?;
    assert_eq!(response.vendor, Some(Vendor::SendGrid));

    let attempts = harness.service.get_attempts(&response.id).await?;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].error, Some(ErrorCode::VendorRateLimited));
    assert_eq!(attempts[0].round, 1);
    assert!(attempts[1].is_success());

    Ok(())
}

/// Test: All email circuits open records FailoverExhausted with every vendor's state
#[tokio::test]
async fn test_all_circuits_open_reports_failover_exhausted() -> Result<()> {
    let (harness, _stubs) = email_harness();
    for vendor in [Vendor::Iterable, Vendor::SendGrid, Vendor::Ses] {
        harness.open_breaker(vendor, Channel::Email).await;
    }

    let response = harness.service.send(email_request(true)).await?;
    assert_eq!(response.status, "retrying");

    let status = harness.service.get_status(&response.id).await?;
    let error = status.last_error.expect("failure diagnostic recorded");
    assert_eq!(error.code, ErrorCode::FailoverExhausted);

    let vendors: Vec<Vendor> = error.vendors.iter().map(|d| d.vendor).collect();
    assert_eq!(vendors, vec![Vendor::Iterable, Vendor::SendGrid, Vendor::Ses]);
    assert!(error
        .vendors
        .iter()
        .all(|d| d.breaker.state == CircuitState::Open && d.reason == SkipReason::CircuitOpen));

    Ok(())
}

/// Test: A vendor that always fails is retried after 1s then 2s and the
/// notification fails after its third round
#[tokio::test(start_paused = true)]
async fn test_always_failing_vendor_exhausts_retries() -> Result<()> {
    let stub = StubAdapter::failing(Vendor::SendGrid, VendorErrorKind::Unavailable);
    let registry = VendorRegistry::new()
        .with_adapter(stub.clone())
        .with_priorities(Channel::Email, vec![Vendor::SendGrid])?;
    let harness = Harness::new(registry);

    let response = harness.service.send(email_request(false)).await?;
    assert_eq!(response.status, "queued");
    harness.gateway.flush().await?;

    let outcome = process_next(&harness, Duration::ZERO).await?;
    assert_eq!(
        outcome,
        ProcessOutcome::Retrying {
            delay: Duration::from_millis(1000)
        }
    );
    let pending = harness.queue.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1, Duration::from_millis(1000));
    assert_eq!(
        harness.service.get_status(&response.id).await?.status,
        NotificationStatus::Retrying
    );

    assert!(
        harness
            .gateway
            .receive_messages(1, Duration::from_millis(500))
            .await?
            .is_empty(),
        "Retry must not be visible before its delay"
    );

    let outcome = process_next(&harness, Duration::from_secs(1)).await?;
    assert_eq!(
        outcome,
        ProcessOutcome::Retrying {
            delay: Duration::from_millis(2000)
        }
    );
    assert_eq!(harness.queue.pending().await[0].1, Duration::from_millis(2000));

    let outcome = process_next(&harness, Duration::from_secs(3)).await?;
    assert_eq!(
        outcome,
        ProcessOutcome::Failed {
            code: ErrorCode::MaxRetriesExceeded
        }
    );
    assert!(harness.queue.is_empty().await, "Failed notification is not requeued");

    let status = harness.service.get_status(&response.id).await?;
    assert_eq!(status.status, NotificationStatus::Failed);
    assert_eq!(status.attempts, 3);
    let error = status.last_error.expect("failure diagnostic recorded");
    assert_eq!(error.code, ErrorCode::MaxRetriesExceeded);
    assert_eq!(error.vendors.len(), 1);
    assert_eq!(error.vendors[0].reason, SkipReason::SendFailed);
    assert!(
        error.vendors[0]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("VENDOR_UNAVAILABLE"))
    );

    let attempts = harness.service.get_attempts(&response.id).await?;
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|a| a.round).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts.iter().all(|a| a.vendor == Some(Vendor::SendGrid)));
    assert_eq!(stub.sends(), 3);

    Ok(())
}

/// Test: Backoff doubles from the base delay
#[test]
fn test_backoff_schedule() {
    assert_eq!(backoff_delay(1000, 0), Duration::from_millis(1000));
    assert_eq!(backoff_delay(1000, 1), Duration::from_millis(2000));
    assert_eq!(backoff_delay(1000, 2), Duration::from_millis(4000));
}

/// Test: Repeated status reads without changes are identical
#[tokio::test]
async fn test_get_status_is_idempotent() -> Result<()> {
    let (harness, _stubs) = email_harness();
    let response = harness.service.send(email_request(false)).await?;

    let first = harness.service.get_status(&response.id).await?;
    let second = harness.service.get_status(&response.id).await?;
    assert_eq!(first, second);

    harness.store.delete(&status_key(&response.id)).await?;
    let rebuilt = harness.service.get_status(&response.id).await?;
    assert_eq!(first, rebuilt, "Rebuilt status matches the cached one");
    assert_eq!(rebuilt.status, NotificationStatus::Queued);

    Ok(())
}

/// Test: Unknown ids are the only status query that fails
#[tokio::test]
async fn test_unknown_notification_is_not_found() -> Result<()> {
    let (harness, _stubs) = email_harness();

    let status = harness.service.get_status("missing").await;
    assert!(matches!(status, Err(DispatchError::NotFound { .. })));

    let attempts = harness.service.get_attempts("missing").await;
    assert!(matches!(attempts, Err(DispatchError::NotFound { .. })));

    let retry = harness.service.retry("missing").await;
    assert!(matches!(retry, Err(DispatchError::NotFound { .. })));

    Ok(())
}

/// Test: Invalid requests fail fast without touching the queue
#[tokio::test]
async fn test_validation_fails_fast() -> Result<()> {
    let (harness, _stubs) = email_harness();

    let mut bad_recipient = email_request(false);
    bad_recipient.payload.recipient = "not-an-email".to_string();
    let err = harness.service.send(bad_recipient).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);

    let mut bad_channel = email_request(false);
    bad_channel.channel = "fax".to_string();
    let err = harness.service.send(bad_channel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidChannel);

    let mut no_content = email_request(false);
    no_content.payload.content = None;
    let err = harness.service.send(no_content).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);

    harness.gateway.flush().await?;
    assert!(harness.queue.is_empty().await);

    Ok(())
}

/// Test: Template references are rendered before delivery
#[tokio::test]
async fn test_template_is_rendered() -> Result<()> {
    let (harness, _stubs) = email_harness();

    let request = SendRequest {
        channel: "email".to_string(),
        payload: NotificationPayload {
            recipient: "ada@example.com".to_string(),
            content: None,
            template_id: Some("welcome".to_string()),
            context: HashMap::from([("name".to_string(), json!("Ada"))]),
        },
        options: SendOptions::default(),
    };
    let response = harness.service.send(request).await?;
    harness.gateway.flush().await?;

    let messages = harness.gateway.receive_messages(1, Duration::ZERO).await?;
    let envelope = messages[0].envelope()?;
    assert_eq!(envelope.id, response.id);
    let content = envelope.payload.content.expect("rendered content");
    assert_eq!(content.subject.as_deref(), Some("Welcome"));
    assert_eq!(content.body, "Hello Ada");

    let mut missing = email_request(false);
    missing.payload.content = None;
    missing.payload.template_id = Some("nope".to_string());
    let err = harness.service.send(missing).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TemplateNotFound);

    Ok(())
}

/// Test: Sends with the same idempotency key return the first notification
#[tokio::test]
async fn test_idempotency_key_deduplicates() -> Result<()> {
    let (harness, _stubs) = email_harness();

    let mut request = email_request(false);
    request.options.idempotency_key = Some("order-42".to_string());

    let first = harness.service.send(request.clone()).await?;
    let second = harness.service.send(request).await?;

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, "queued");
    assert_eq!(harness.gateway.buffered().await, 1, "Only one message queued");

    Ok(())
}

/// Test: A malformed request to the vendor fails without failover and can be retried
#[tokio::test]
async fn test_invalid_request_fails_and_retry_requeues() -> Result<()> {
    let stubs = vec![
        StubAdapter::failing(Vendor::Iterable, VendorErrorKind::InvalidRequest),
        StubAdapter::healthy(Vendor::SendGrid),
    ];
    let harness = Harness::new(registry_with(&stubs));

    let response = harness.service.send(email_request(true)).await?;
    assert_eq!(response.status, "failed");
    assert_eq!(stubs[1].sends(), 0, "Malformed requests are not failed over");

    let status = harness.service.get_status(&response.id).await?;
    let error = status.last_error.expect("failure diagnostic recorded");
    assert_eq!(error.code, ErrorCode::DeliveryFailed);
    assert!(error.message.contains("VENDOR_INVALID_REQUEST"));
    assert_eq!(error.vendors[0].vendor, Vendor::Iterable);
    assert_eq!(error.vendors[0].reason, SkipReason::SendFailed);

    let report = assert_ok!(harness.service.retry(&response.id).await);
    assert_eq!(report.status, NotificationStatus::Queued);
    assert_eq!(harness.queue.len().await, 1);

    let err = harness.service.retry(&response.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument, "Only failed notifications retry");

    Ok(())
}

/// Test: Retrying a notification that used every round is rejected
#[tokio::test(start_paused = true)]
async fn test_retry_after_exhaustion_is_rejected() -> Result<()> {
    let stub = StubAdapter::failing(Vendor::Iterable, VendorErrorKind::Unavailable);
    let registry = VendorRegistry::new()
        .with_adapter(stub)
        .with_priorities(Channel::Email, vec![Vendor::Iterable])?;
    let harness = Harness::new(registry);

    let response = harness.service.send(email_request(true)).await?;
    assert_eq!(response.status, "retrying");
    process_next(&harness, Duration::from_secs(2)).await?;
    process_next(&harness, Duration::from_secs(3)).await?;

    let err = harness.service.retry(&response.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MaxRetriesExceeded);

    Ok(())
}

/// Test: Redelivered messages for finished notifications are skipped
#[tokio::test]
async fn test_redelivery_after_delivery_is_skipped() -> Result<()> {
    let (harness, stubs) = email_harness();
    let response = harness.service.send(email_request(false)).await?;
    harness.gateway.flush().await?;

    let messages = harness.gateway.receive_messages(1, Duration::ZERO).await?;
    let outcome = harness.service.process(&messages[0]).await?;
    assert!(matches!(outcome, ProcessOutcome::Delivered { vendor: Vendor::Iterable, .. }));

    let again = harness.service.process(&messages[0]).await?;
    assert_eq!(again, ProcessOutcome::Skipped);
    assert_eq!(stubs[0].sends(), 1, "Delivered notifications are not resent");
    assert_eq!(
        harness.service.get_status(&response.id).await?.status,
        NotificationStatus::Delivered
    );

    Ok(())
}

/// Test: A message that is not an envelope is rejected as an invalid payload
#[tokio::test]
async fn test_malformed_envelope_is_rejected() -> Result<()> {
    let (harness, _stubs) = email_harness();

    let message = QueueMessage {
        id: "m-1".to_string(),
        body: "{not json".to_string(),
        receipt_handle: "r-1".to_string(),
        receive_count: 1,
        attributes: HashMap::new(),
    };

    let err = harness.service.process(&message).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);

    Ok(())
}

/// Test: Envelope carries the wire fields consumers rely on
#[tokio::test]
async fn test_envelope_wire_format() -> Result<()> {
    let (harness, _stubs) = email_harness();
    let response = harness.service.send(email_request(false)).await?;
    harness.gateway.flush().await?;

    let messages = harness.queue.receive(1, Duration::ZERO, Duration::from_secs(30)).await?;
    let body: serde_json::Value = serde_json::from_str(&messages[0].body)?;

    assert_eq!(body["id"], json!(response.id));
    assert_eq!(body["channel"], json!("email"));
    assert_eq!(body["status"], json!("queued"));
    assert_eq!(body["retry_count"], json!(0));
    assert_eq!(body["tenant_id"], json!("default"));
    assert!(body["timestamp"].is_i64());

    let envelope: QueueEnvelope = serde_json::from_value(body)?;
    assert_eq!(envelope.payload.recipient, "user@example.com");

    Ok(())
}

/// Test: Worker processes and acknowledges queued notifications
#[tokio::test]
async fn test_worker_acknowledges_processed_messages() -> Result<()> {
    let (harness, _stubs) = email_harness();
    let response = harness.service.send(email_request(false)).await?;
    harness.gateway.flush().await?;

    let worker = Worker::new(
        Arc::clone(&harness.gateway),
        Arc::clone(&harness.service),
        WorkerConfig::default(),
    );
    let messages = harness.gateway.receive_messages(1, Duration::ZERO).await?;
    assert!(worker.handle(0, &messages[0]).await);

    assert!(harness.queue.is_empty().await);
    assert_eq!(
        harness.service.get_status(&response.id).await?.status,
        NotificationStatus::Delivered
    );

    Ok(())
}

/// Test: Workers deliver each notification once even when a batch takes
/// longer than the visibility timeout to send one by one
#[tokio::test(start_paused = true)]
async fn test_slow_vendor_batch_is_delivered_once() -> Result<()> {
    let stub = StubAdapter::healthy(Vendor::Iterable).slow(Duration::from_secs(4));
    let registry = VendorRegistry::new()
        .with_adapter(stub.clone())
        .with_priorities(Channel::Email, vec![Vendor::Iterable])?;
    let harness = Harness::new(registry);

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(harness.service.send(email_request(false)).await?.id);
    }
    harness.gateway.flush().await?;

    let worker = Arc::new(Worker::new(
        Arc::clone(&harness.gateway),
        Arc::clone(&harness.service),
        WorkerConfig::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = worker.spawn_all(shutdown_rx);

    tokio::time::sleep(Duration::from_secs(120)).await;
    shutdown_tx.send(true)?;
    for handle in handles {
        handle.await?;
    }

    assert_eq!(stub.sends(), 10, "Each notification is sent exactly once");
    assert!(harness.queue.is_empty().await);
    for id in &ids {
        assert_eq!(
            harness.service.get_status(id).await?.status,
            NotificationStatus::Delivered
        );
    }

    Ok(())
}

/// Test: Two workers holding the same message run the round only once
#[tokio::test(start_paused = true)]
async fn test_concurrent_redelivery_is_in_flight() -> Result<()> {
    let stub = StubAdapter::healthy(Vendor::Iterable).slow(Duration::from_secs(4));
    let registry = VendorRegistry::new()
        .with_adapter(stub.clone())
        .with_priorities(Channel::Email, vec![Vendor::Iterable])?;
    let harness = Harness::new(registry);

    harness.service.send(email_request(false)).await?;
    harness.gateway.flush().await?;
    let messages = harness.gateway.receive_messages(1, Duration::ZERO).await?;

    let (first, second) = tokio::join!(
        harness.service.process(&messages[0]),
        harness.service.process(&messages[0])
    );
    let mut outcomes = vec![first?, second?];
    outcomes.sort_by_key(|outcome| outcome == &ProcessOutcome::InFlight);

    assert!(matches!(outcomes[0], ProcessOutcome::Delivered { vendor: Vendor::Iterable, .. }));
    assert_eq!(outcomes[1], ProcessOutcome::InFlight);
    assert_eq!(stub.sends(), 1, "The losing worker does not send");

    Ok(())
}

/// Test: A live claim leaves the message alone, an abandoned one is taken over
#[tokio::test]
async fn test_abandoned_claim_is_taken_over() -> Result<()> {
    let (harness, stubs) = email_harness();
    let response = harness.service.send(email_request(false)).await?;
    harness.gateway.flush().await?;
    let messages = harness.gateway.receive_messages(1, Duration::ZERO).await?;

    let key = record_key(&response.id);
    let raw = harness.store.get(&key).await?.expect("record saved");
    let mut notification: Notification = serde_json::from_str(&raw)?;
    notification.transition(NotificationStatus::Processing)?;

    notification.claimed_at = Some(Utc::now());
    harness.store.set(&key, &serde_json::to_string(&notification)?).await?;

    let worker = Worker::new(
        Arc::clone(&harness.gateway),
        Arc::clone(&harness.service),
        WorkerConfig::default(),
    );
    assert!(!worker.handle(0, &messages[0]).await, "Claimed rounds are not acknowledged");
    assert_eq!(stubs[0].sends(), 0);

    notification.claimed_at = Some(Utc::now() - TimeDelta::seconds(60));
    harness.store.set(&key, &serde_json::to_string(&notification)?).await?;

    let outcome = harness.service.process(&messages[0]).await?;
    assert!(matches!(outcome, ProcessOutcome::Delivered { vendor: Vendor::Iterable, .. }));
    assert_eq!(stubs[0].sends(), 1);

    Ok(())
}
