use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::ErrorCode,
    models::message::QueueMessage,
    services::{
        gateway::QueueGateway,
        orchestrator::{NotificationService, ProcessOutcome},
    },
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub receive_batch_size: usize,
    pub receive_wait: Duration,
    /// Pause after a failed receive before polling again.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            receive_batch_size: 10,
            receive_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Queue consumer: receive, process, acknowledge.
///
/// Messages whose processing hits an infrastructure error are left
/// unacknowledged; the visibility timeout hands them to another worker and
/// the gateway dead-letters them once they exceed the receive limit.
pub struct Worker {
    gateway: Arc<QueueGateway>,
    service: Arc<NotificationService>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        gateway: Arc<QueueGateway>,
        service: Arc<NotificationService>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            gateway,
            service,
            config,
        }
    }

    pub fn spawn_all(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|worker_id| {
                let worker = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(worker_id, shutdown).await })
            })
            .collect()
    }

    pub async fn run(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Worker started");

        loop {
            let received = tokio::select! {
                received = self
                    .gateway
                    .receive_messages(self.config.receive_batch_size, self.config.receive_wait) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                // The whole batch shares one visibility lease, so it is
                // handled concurrently rather than one message at a time.
                Ok(messages) => {
                    join_all(messages.iter().map(|message| self.handle(worker_id, message))).await;
                }
                Err(e) if e.code() == ErrorCode::CircuitOpen => {
                    debug!(worker_id, "Queue circuit open, backing off");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "Failed to receive messages");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        info!(worker_id, "Worker stopped");
    }

    /// Returns whether the message was acknowledged.
    pub async fn handle(&self, worker_id: usize, message: &QueueMessage) -> bool {
        let outcome = match self.service.process(message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    worker_id,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    error = %e,
                    "Processing failed, leaving message for redelivery"
                );
                return false;
            }
        };

        match outcome {
            ProcessOutcome::InFlight => {
                debug!(worker_id, message_id = %message.id, "Round claimed elsewhere, leaving message");
                return false;
            }
            ProcessOutcome::Skipped => {
                debug!(worker_id, message_id = %message.id, "Acknowledging duplicate delivery");
            }
            _ => {}
        }

        match self.gateway.delete_message(&message.receipt_handle).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    worker_id,
                    message_id = %message.id,
                    "Lease lapsed before acknowledgement, message may be redelivered"
                );
                false
            }
            Err(e) => {
                warn!(worker_id, message_id = %message.id, error = %e, "Failed to acknowledge message");
                false
            }
        }
    }
}
