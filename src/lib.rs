//! # Castor
//!
//! A batched, multi-queue message consumer for Rust. Castor rotates over a fixed set of
//! queues, hands each delivery to your handler and acknowledges successful deliveries in
//! batches instead of one at a time.
//!
//! ## Features
//!
//! - **Generic Design**: Works with any broker by implementing the [`MessageQueue`] and [`DeliveryHandler`] traits
//! - **Fair Rotation**: Every queue is polled once per lap, so no queue starves the others
//! - **Batched Acknowledgement**: Deferred deliveries are settled with one cumulative ack per queue
//! - **Size and Idle Flushing**: Batches flush when they reach `block_size` or after `idle_timeout`
//! - **Error Containment**: Handler errors and panics turn into rejects or nacks, never into a dead consumer
//! - **Cooperative Shutdown**: Stop from another task, from a callback or on Ctrl-C / SIGTERM
//! - **Structured Logging**: Tracing events with queue names, delivery tags and batch sizes
//!
//! ## Quick Start
//!
//! ```rust
//! use castor::{CallbackHandler, ConsumerHandle, MessageEnvelope, MessageQueue, MultiQueueConsumer};
//! use std::time::Duration;
//!
//! // 1. Implement MessageQueue for your broker
//! struct MyQueue;
//! impl MessageQueue for MyQueue {
//!     type Error = std::io::Error;
//!     type Payload = String;
//!     type DeliveryTag = u64;  // AMQP delivery tags
//!
//!     fn name(&self) -> &str {
//!         "my-queue"
//!     }
//!
//!     async fn poll(&self) -> Result<Option<MessageEnvelope<String, u64>>, Self::Error> {
//!         // basic.get against your broker
//!         Ok(Some(MessageEnvelope::new("hello".to_string(), 1)))
//!     }
//!
//!     async fn ack(&self, tag: u64, multiple: bool) -> Result<(), Self::Error> {
//!         println!("ack {tag} (multiple: {multiple})");
//!         Ok(())
//!     }
//!
//!     async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<(), Self::Error> {
//!         println!("nack {tag} (multiple: {multiple}, requeue: {requeue})");
//!         Ok(())
//!     }
//!
//!     async fn reject(&self, tag: u64, requeue: bool) -> Result<(), Self::Error> {
//!         println!("reject {tag} (requeue: {requeue})");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 2. Register your business logic; `None` defers the ack to the next batch flush
//! let handler = CallbackHandler::<MyQueue, _>::new(
//!     |envelope: &MessageEnvelope<String, u64>, _queue: &MyQueue, _consumer: &ConsumerHandle| {
//!         println!("processing {}", envelope.payload);
//!         Ok(None::<bool>)
//!     },
//! );
//!
//! // 3. Create the consumer over one or more queues
//! let mut consumer = MultiQueueConsumer::with_defaults(vec![MyQueue, MyQueue], handler)?
//!     .with_block_size(25)
//!     .with_idle_timeout(Duration::from_secs(2))
//!     .with_signal_handling(true);
//!
//! // 4. Consume until 100 deliveries were processed or the process is interrupted
//! let stats = consumer.consume(100).await?;
//! println!("consumed {}, acked {}", stats.consumed, stats.acked);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[`MessageQueue`]**: Polls and settles deliveries on one broker queue
//! - **[`DeliveryHandler`]**: Processes deliveries and commits batches; answers with a [`Directive`]
//! - **[`MultiQueueConsumer`]**: Owns the queues, runs the lap loop and the batch bookkeeping
//!
//! ### How it Works
//!
//! Each lap visits the queues in order and:
//! 1. Polls the queue for at most one delivery (sleeping `wait_timeout` when the first queue is empty)
//! 2. Passes the delivery to the handler
//! 3. Applies the directive: `Defer` adds it to the batch, `Ack` settles the batch now,
//!    `Reject`/`RejectRequeue` flush the batch and reject the delivery on its own
//! 4. Flushes the batch when it reached `block_size` or `idle_timeout` expired; the flush
//!    callback decides between a cumulative ack and a cumulative nack
//! 5. Stops when shut down or when the target count was reached, flushing what is left
//!
//! ## Examples
//!
//! See `demos/rabbitmq_consumer.rs` for a RabbitMQ integration built on `lapin`.

mod callbacks;
mod consumer;
mod delivery_handler;
mod error;
mod message_queue;
mod shutdown;

pub use callbacks::CallbackHandler;
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, MultiQueueConsumer};
pub use delivery_handler::{DeliveryHandler, Directive};
pub use error::{ConsumerError, HandlerError, HandlerPanic};
pub use message_queue::{MessageEnvelope, MessageQueue};
pub use shutdown::ShutdownHandle;
