use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use tokio::{
    sync::{Mutex, watch},
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    clients::{circuit_breaker::BreakerRegistry, queue::QueueBackend},
    error::{DispatchError, DispatchResult},
    models::{
        circuit_breaker::BreakerKey,
        message::{OutboundMessage, QueueMessage},
    },
};

pub const QUEUE_BACKEND_COMPONENT: &str = "queue-backend";
const SYSTEM_TENANT: &str = "_system";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub batch_max_size: usize,
    pub batch_wait: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    /// Upper bound on one backend call, on top of any long-poll wait.
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_max_size: 10,
            batch_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 3,
            call_timeout: Duration::from_secs(10),
        }
    }
}

struct SendBuffer {
    items: Vec<OutboundMessage>,
    last_flush: Instant,
    /// Set once the flusher has stopped; later sends skip the buffer.
    closed: bool,
}

/// Breaker-guarded, batching front for a [`QueueBackend`].
pub struct QueueGateway {
    backend: Arc<dyn QueueBackend>,
    breakers: BreakerRegistry,
    breaker_key: BreakerKey,
    config: GatewayConfig,
    buffer: Mutex<SendBuffer>,
}

impl QueueGateway {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        breakers: BreakerRegistry,
        queue_name: &str,
        config: GatewayConfig,
    ) -> Self {
        info!(
            backend = backend.name(),
            queue = queue_name,
            batch_max_size = config.batch_max_size,
            "Queue gateway initialized"
        );

        Self {
            backend,
            breakers,
            breaker_key: BreakerKey::new(QUEUE_BACKEND_COMPONENT, queue_name, SYSTEM_TENANT),
            config,
            buffer: Mutex::new(SendBuffer {
                items: Vec::new(),
                last_flush: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn breaker_key(&self) -> &BreakerKey {
        &self.breaker_key
    }

    /// Buffers one message. A full buffer is flushed before and after the
    /// push; if the buffer is full and cannot be flushed the message is
    /// rejected with the flush error. After the flusher has shut down the
    /// message is sent straight through instead.
    pub async fn send_message(&self, message: OutboundMessage) -> DispatchResult<()> {
        let mut buffer = self.buffer.lock().await;

        if buffer.closed {
            drop(buffer);
            return self.send_batch(vec![message]).await.map(|_| ());
        }

        if buffer.items.len() >= self.config.batch_max_size {
            self.flush_locked(&mut buffer).await?;
        }

        buffer.items.push(message);

        if buffer.items.len() >= self.config.batch_max_size {
            if let Err(e) = self.flush_locked(&mut buffer).await {
                warn!(error = %e, buffered = buffer.items.len(), "Batch flush failed, keeping messages buffered");
            }
        }

        Ok(())
    }

    /// Sends immediately, bypassing the buffer, in chunks of the batch size.
    pub async fn send_batch(&self, messages: Vec<OutboundMessage>) -> DispatchResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());

        for chunk in messages.chunks(self.config.batch_max_size.max(1)) {
            let chunk = chunk.to_vec();
            let sent = self
                .guarded("send_batch", self.config.call_timeout, || {
                    self.backend.send_batch(chunk)
                })
                .await?;
            ids.extend(sent);
        }

        Ok(ids)
    }

    pub async fn flush(&self) -> DispatchResult<usize> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.items.len()
    }

    /// Receives up to `max` messages, dead-lettering any that have been
    /// received more than `max_receive_count` times.
    pub async fn receive_messages(
        &self,
        max: usize,
        wait: Duration,
    ) -> DispatchResult<Vec<QueueMessage>> {
        let visibility_timeout = self.config.visibility_timeout;
        let messages = self
            .guarded("receive", wait + self.config.call_timeout, || {
                self.backend.receive(max, wait, visibility_timeout)
            })
            .await?;

        let mut deliverable = Vec::with_capacity(messages.len());
        for message in messages {
            if message.receive_count <= self.config.max_receive_count {
                deliverable.push(message);
                continue;
            }

            let reason = format!(
                "received {} times, limit is {}",
                message.receive_count, self.config.max_receive_count
            );
            match self
                .guarded("dead_letter", self.config.call_timeout, || {
                    self.backend.dead_letter(&message, &reason)
                })
                .await
            {
                Ok(()) => warn!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "Message moved to dead-letter queue"
                ),
                Err(e) => warn!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to dead-letter message, it will be redelivered"
                ),
            }
        }

        Ok(deliverable)
    }

    /// Returns false when the lease had already lapsed.
    pub async fn delete_message(&self, receipt_handle: &str) -> DispatchResult<bool> {
        self.guarded("delete", self.config.call_timeout, || {
            self.backend.delete(receipt_handle)
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), Error> {
        timeout(self.config.call_timeout, self.backend.ping())
            .await
            .map_err(|_| anyhow!("Queue backend ping timed out"))?
    }

    /// Flushes whenever `batch_wait` has passed since the last flush, and
    /// once more on shutdown. Nothing is buffered after that final flush.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let due = self.buffer.lock().await.last_flush + self.config.batch_wait;

            tokio::select! {
                _ = sleep_until(due) => {
                    if let Err(e) = self.flush_if_due().await {
                        warn!(error = %e, "Scheduled batch flush failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let mut buffer = self.buffer.lock().await;
        buffer.closed = true;

        match self.flush_locked(&mut buffer).await {
            Ok(count) => info!(count, "Flushed send buffer on shutdown"),
            Err(e) => warn!(error = %e, "Failed to flush send buffer on shutdown"),
        }
    }

    async fn flush_if_due(&self) -> DispatchResult<usize> {
        let mut buffer = self.buffer.lock().await;

        if buffer.last_flush.elapsed() < self.config.batch_wait {
            return Ok(0);
        }

        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut SendBuffer) -> DispatchResult<usize> {
        buffer.last_flush = Instant::now();

        if buffer.items.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut buffer.items);
        let count = batch.len();

        match self
            .guarded("send_batch", self.config.call_timeout, || {
                self.backend.send_batch(batch.clone())
            })
            .await
        {
            Ok(_) => {
                debug!(count, "Flushed message batch");
                Ok(count)
            }
            Err(e) => {
                buffer.items = batch;
                Err(e)
            }
        }
    }

    /// Runs one backend call behind the queue breaker and a timeout. A timeout
    /// counts as a breaker failure.
    async fn guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        limit: Duration,
        call: F,
    ) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let breaker = self.breakers.breaker(self.breaker_key.clone());

        breaker
            .call(|| async move {
                match timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "Queue {} timed out after {}ms",
                        operation,
                        limit.as_millis()
                    )),
                }
            })
            .await
            .map_err(DispatchError::from)
    }
}
