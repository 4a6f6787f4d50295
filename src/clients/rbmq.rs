use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    clients::queue::QueueBackend,
    models::message::{DlqMessage, OutboundMessage, QueueMessage},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RabbitMQ-backed delivery queue.
///
/// - the main queue is a quorum queue so the broker reports `x-delivery-count`;
/// - delayed messages wait in `{queue}.delay` with a per-message TTL and are
///   dead-lettered back into the main queue when it expires;
/// - a received message is leased to its receiver and nacked back onto the
///   queue if it is not acknowledged within the visibility timeout.
pub struct RabbitMqClient {
    channel: Channel,
    queue_name: String,
    delay_queue_name: String,
    failed_queue_name: String,
    leases: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl RabbitMqClient {
    pub async fn connect(
        rabbitmq_url: &str,
        queue_name: &str,
        failed_queue_name: &str,
        prefetch_count: u16,
    ) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        let mut main_args = FieldTable::default();
        main_args.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString("quorum".into()),
        );
        channel
            .queue_declare(queue_name, durable, main_args)
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue_name, e))?;

        let delay_queue_name = format!("{}.delay", queue_name);
        let mut delay_args = FieldTable::default();
        delay_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        delay_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue_name.into()),
        );
        channel
            .queue_declare(&delay_queue_name, durable, delay_args)
            .await
            .map_err(|e| anyhow!("Failed to declare delay queue: {}", e))?;

        channel
            .queue_declare(failed_queue_name, durable, FieldTable::default())
            .await
            .map_err(|_| anyhow!("Failed to declare failed queue"))?;

        info!(queue = %queue_name, "RabbitMQ queues declared");

        Ok(Self {
            channel,
            queue_name: queue_name.to_string(),
            delay_queue_name,
            failed_queue_name: failed_queue_name.to_string(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error> {
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", routing_key, e))?;

        Ok(())
    }

    fn delivery_count(properties: &BasicProperties) -> u32 {
        properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get("x-delivery-count").cloned())
            .and_then(|value| match value {
                AMQPValue::LongLongInt(n) => Some(n as u32),
                AMQPValue::LongInt(n) => Some(n as u32),
                AMQPValue::LongUInt(n) => Some(n),
                AMQPValue::ShortInt(n) => Some(n as u32),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn string_headers(properties: &BasicProperties) -> HashMap<String, String> {
        properties
            .headers()
            .as_ref()
            .map(|headers| {
                headers
                    .inner()
                    .iter()
                    .filter_map(|(k, v)| match v {
                        AMQPValue::LongString(s) => Some((k.to_string(), s.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the delivery to the queue once its lease lapses.
    fn start_lease(&self, delivery_tag: u64, visibility_timeout: Duration) -> JoinHandle<()> {
        let channel = self.channel.clone();
        let leases = Arc::clone(&self.leases);

        tokio::spawn(async move {
            tokio::time::sleep(visibility_timeout).await;

            if leases.lock().await.remove(&delivery_tag).is_none() {
                return;
            }

            debug!(delivery_tag, "Visibility timeout lapsed, returning message to queue");
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(delivery_tag, error = %e, "Failed to return expired lease to queue");
            }
        })
    }

    async fn release_lease(&self, receipt_handle: &str) -> Result<Option<u64>, Error> {
        let delivery_tag: u64 = receipt_handle
            .parse()
            .map_err(|_| anyhow!("Malformed receipt handle '{}'", receipt_handle))?;

        Ok(self
            .leases
            .lock()
            .await
            .remove(&delivery_tag)
            .map(|lease| {
                lease.abort();
                delivery_tag
            }))
    }
}

#[async_trait]
impl QueueBackend for RabbitMqClient {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> Result<Vec<String>, Error> {
        let mut ids = Vec::with_capacity(messages.len());

        for message in messages {
            let mut headers = FieldTable::default();
            for (key, value) in &message.attributes {
                headers.insert(
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(value.clone().into()),
                );
            }

            let mut properties = BasicProperties::default()
                .with_delivery_mode(2)
                .with_message_id(ShortString::from(message.id.clone()))
                .with_headers(headers);

            let routing_key = if message.delay.is_zero() {
                &self.queue_name
            } else {
                properties = properties
                    .with_expiration(ShortString::from(message.delay.as_millis().to_string()));
                &self.delay_queue_name
            };

            self.publish(routing_key, message.body.as_bytes(), properties)
                .await?;
            ids.push(message.id);
        }

        Ok(ids)
    }

    async fn receive(
        &self,
        max: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, Error> {
        let deadline = Instant::now() + wait;
        let mut received = Vec::new();

        loop {
            while received.len() < max {
                let Some(message) = self
                    .channel
                    .basic_get(&self.queue_name, BasicGetOptions { no_ack: false })
                    .await
                    .map_err(|e| anyhow!("Failed to get from {}: {}", self.queue_name, e))?
                else {
                    break;
                };

                let delivery = &message.delivery;
                let mut leases = self.leases.lock().await;
                let lease = self.start_lease(delivery.delivery_tag, visibility_timeout);
                leases.insert(delivery.delivery_tag, lease);
                drop(leases);

                received.push(QueueMessage {
                    id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                    body: String::from_utf8_lossy(&delivery.data).into_owned(),
                    receipt_handle: delivery.delivery_tag.to_string(),
                    receive_count: Self::delivery_count(&delivery.properties) + 1,
                    attributes: Self::string_headers(&delivery.properties),
                });
            }

            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<bool, Error> {
        let Some(delivery_tag) = self.release_lease(receipt_handle).await? else {
            return Ok(false);
        };

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to acknowledge message"))?;

        Ok(true)
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), Error> {
        let dlq_message = DlqMessage {
            message_id: message.id.clone(),
            original_body: message.body.clone(),
            receive_count: message.receive_count,
            failure_reason: reason.to_string(),
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let payload = serde_json::to_vec(&dlq_message)?;

        self.publish(
            &self.failed_queue_name,
            &payload,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .map_err(|_| anyhow!("Failed to publish message to dlq"))?;

        self.delete(&message.receipt_handle).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        if self.channel.status().connected() {
            Ok(())
        } else {
            Err(anyhow!("RabbitMQ channel is not connected"))
        }
    }
}
