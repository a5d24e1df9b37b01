use std::time::Duration;

use anyhow::Context;
use castor::{
    ConsumerHandle, DeliveryHandler, Directive, HandlerError, MessageEnvelope, MessageQueue,
    MultiQueueConsumer,
};
use lapin::{Channel, Connection, ConnectionProperties, options::*, types::FieldTable};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct RabbitMQConfig {
    pub queue_name: String,
    pub prefetch_count: u16,
}

impl Default for RabbitMQConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            prefetch_count: 50,
        }
    }
}

/// One named queue on its own channel
#[derive(Clone)]
pub struct RabbitMQQueue {
    channel: Channel,
    config: RabbitMQConfig,
}

impl RabbitMQQueue {
    pub async fn new(connection: &Connection, config: RabbitMQConfig) -> anyhow::Result<Self> {
        // Delivery tags are scoped to the channel, so every queue gets its own
        let channel = connection.create_channel().await?;

        // Set QoS (prefetch count)
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        // Declare the queue (idempotent operation)
        channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self { channel, config })
    }
}

#[derive(Clone, Debug)]
pub struct RabbitMQMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
}

impl MessageQueue for RabbitMQQueue {
    type Error = lapin::Error;
    type Payload = RabbitMQMessage;
    type DeliveryTag = u64;

    fn name(&self) -> &str {
        &self.config.queue_name
    }

    async fn poll(&self) -> Result<Option<MessageEnvelope<RabbitMQMessage, u64>>, Self::Error> {
        let result = self
            .channel
            .basic_get(&self.config.queue_name, BasicGetOptions { no_ack: false })
            .await?;

        Ok(result.map(|get_ok| {
            let delivery = get_ok.delivery;
            let message = RabbitMQMessage {
                body: delivery.data,
                routing_key: delivery.routing_key.as_str().to_string(),
            };
            MessageEnvelope::new(message, delivery.delivery_tag)
        }))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), Self::Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), Self::Error> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
    }
}

/// Treats the body as a number of milliseconds of work.
///
/// Bodies that are not numbers are rejected, bodies prefixed with `!` are acked at once.
pub struct SleepHandler;

impl DeliveryHandler<RabbitMQQueue> for SleepHandler {
    async fn handle_delivery(
        &self,
        envelope: &MessageEnvelope<RabbitMQMessage, u64>,
        queue: &RabbitMQQueue,
        _consumer: &ConsumerHandle,
    ) -> Result<Directive, HandlerError> {
        let body = String::from_utf8_lossy(&envelope.payload.body).into_owned();
        let (urgent, body) = match body.strip_prefix('!') {
            Some(rest) => (true, rest.to_string()),
            None => (false, body),
        };

        let wait_ms = body.trim().parse::<u64>()?;
        tracing::info!(queue = queue.name(), wait_ms, urgent, "processing message");
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        Ok(if urgent {
            Directive::Ack
        } else {
            Directive::Defer
        })
    }

    async fn flush_deferred(&self, consumer: &ConsumerHandle) -> Result<bool, HandlerError> {
        tracing::info!(unacked = consumer.unacked_count(), "committing batch");
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .init();

    let rabbitmq_url = std::env::var("RABBITMQ_URL").context("RABBITMQ_URL is not set")?;

    let queue_names = std::env::var("RABBITMQ_QUEUE_NAMES")
        .unwrap_or_else(|_| "castor-high,castor-low".to_string());

    let target = std::env::var("CASTOR_TARGET")
        .ok()
        .map(|value| value.parse::<u64>())
        .transpose()
        .context("CASTOR_TARGET must be a number")?
        .unwrap_or(0);

    let connection = Connection::connect(&rabbitmq_url, ConnectionProperties::default()).await?;

    let prefetch_count = RabbitMQConfig::default().prefetch_count;

    let mut queues = Vec::new();
    for queue_name in queue_names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let config = RabbitMQConfig {
            queue_name: queue_name.to_string(),
            prefetch_count,
        };
        queues.push(RabbitMQQueue::new(&connection, config).await?);
    }

    tracing::info!(queues = queues.len(), target, "initialized rabbitmq queues");

    let mut consumer = MultiQueueConsumer::with_defaults(queues, SleepHandler)?
        .with_block_size(usize::from(prefetch_count))
        .with_idle_timeout(Duration::from_secs(2))
        .with_wait_timeout(Duration::from_millis(250))
        .with_signal_handling(true);

    let stats = consumer.consume(target).await?;

    tracing::info!(?stats, "done");

    connection.close(0, "consumer stopped").await?;

    Ok(())
}
