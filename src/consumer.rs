//! This module contains the configuration and implementation of the multi-queue consumer

use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use tokio::time::Instant;

use crate::{
    ConsumerError, DeliveryHandler, Directive, HandlerError, HandlerPanic, MessageEnvelope,
    MessageQueue, ShutdownHandle, shutdown::SignalListener,
};

/// Configuration for the consumer
///
/// Controls when deferred deliveries are flushed and how long the consumer waits when the
/// queues run dry.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Maximum number of unacknowledged deliveries before the batch is flushed
    ///
    /// Keep this at or below the channel's prefetch count, otherwise the broker stops
    /// delivering before the batch ever fills up.
    /// Default: 10
    pub block_size: usize,
    /// Flush the batch when this much time has passed since the last successful ack
    ///
    /// Default: 5 seconds
    pub idle_timeout: Duration,
    /// Sleep applied when the first queue of a lap comes back empty
    ///
    /// Default: 100 milliseconds
    pub wait_timeout: Duration,
    /// Stop the consumer on Ctrl-C (and SIGTERM on unix)
    ///
    /// Default: false
    pub handle_signals: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_size: 10,
            idle_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_millis(100),
            handle_signals: false,
        }
    }
}

impl ConsumerConfig {
    fn validate<E>(&self) -> Result<(), ConsumerError<E>> {
        if self.block_size == 0 {
            return Err(ConsumerError::InvalidBlockSize);
        }

        Ok(())
    }
}

/// View of the consumer handed to every callback.
///
/// The counters are a snapshot taken right before the callback runs.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    shutdown: ShutdownHandle,
    queue_index: usize,
    consumed_count: u64,
    unacked_count: usize,
    last_message_at: Option<Instant>,
}

impl ConsumerHandle {
    /// Stop the consumer at the end of the current lap
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Whether the consumer will keep going after the current lap
    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    /// Index of the queue the consumer is currently visiting
    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Deliveries counted as consumed (acked or deferred) during this run
    pub fn consumed_count(&self) -> u64 {
        self.consumed_count
    }

    /// Deliveries waiting for the next flush, over all queues
    pub fn unacked_count(&self) -> usize {
        self.unacked_count
    }

    /// When the last delivery was counted as consumed, `None` before the first one
    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }
}

/// Totals for one call to [`MultiQueueConsumer::consume`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries counted as consumed (ack or defer directive)
    pub consumed: u64,
    /// Deliveries settled by a cumulative ack
    pub acked: u64,
    /// Deliveries settled by a cumulative nack
    pub nacked: u64,
    /// Deliveries rejected individually
    pub rejected: u64,
    /// Completed passes over the whole queue set
    pub laps: u64,
}

/// Highest unsettled delivery tag on one queue and how many deliveries it covers
#[derive(Debug)]
struct PendingBatch<T> {
    last_tag: T,
    count: usize,
}

/// Run state owned by the consume loop.
///
/// Pending deliveries are tracked per queue: delivery tags are only ordered within the
/// queue that issued them, so each queue gets its own cumulative ack or nack.
#[derive(Debug)]
struct ConsumerState<T> {
    queue_index: usize,
    consumed_count: u64,
    target: u64,
    pending: Vec<Option<PendingBatch<T>>>,
    last_ack_at: Option<Instant>,
    last_message_at: Option<Instant>,
    stats: ConsumerStats,
}

impl<T> ConsumerState<T> {
    fn new(queue_count: usize) -> Self {
        Self {
            queue_index: 0,
            consumed_count: 0,
            target: 0,
            pending: (0..queue_count).map(|_| None).collect(),
            last_ack_at: None,
            last_message_at: None,
            stats: ConsumerStats::default(),
        }
    }

    /// Start a new run. Pending batches left by a failed run are kept.
    fn reset(&mut self, target: u64) {
        self.queue_index = 0;
        self.consumed_count = 0;
        self.target = target;
        self.last_ack_at = None;
        self.last_message_at = None;
        self.stats = ConsumerStats::default();
    }

    fn unacked_count(&self) -> usize {
        self.pending.iter().flatten().map(|batch| batch.count).sum()
    }

    fn has_pending(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    fn record(&mut self, queue_index: usize, delivery_tag: T) {
        self.consumed_count += 1;
        self.last_message_at = Some(Instant::now());

        match self.pending[queue_index].as_mut() {
            Some(batch) => {
                batch.last_tag = delivery_tag;
                batch.count += 1;
            }
            None => {
                self.pending[queue_index] = Some(PendingBatch {
                    last_tag: delivery_tag,
                    count: 1,
                });
            }
        }
    }

    fn should_flush(&self, config: &ConsumerConfig, now: Instant) -> bool {
        let unacked = self.unacked_count();
        if unacked == 0 {
            return false;
        }

        unacked >= config.block_size
            || self
                .last_ack_at
                .is_some_and(|last_ack| now.duration_since(last_ack) > config.idle_timeout)
    }

    fn target_reached(&self) -> bool {
        self.target != 0 && self.consumed_count >= self.target
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// A consumer that rotates over a fixed set of queues and acknowledges in batches
///
/// Each lap polls every queue once, in order, so a busy queue cannot starve the others.
/// Deliveries the handler defers are acknowledged together once `block_size` of them
/// have piled up or `idle_timeout` has passed since the last ack.
///
/// # Type Parameters
///
/// * `Q` - The queue type that implements [`MessageQueue`]
/// * `H` - The handler type that implements [`DeliveryHandler`]
///
/// # Examples
///
/// ```rust
/// use castor::{CallbackHandler, Directive, MessageEnvelope, MessageQueue, MultiQueueConsumer};
/// # struct MyQueue;
/// # impl MessageQueue for MyQueue {
/// #     type Error = std::io::Error;
/// #     type Payload = String;
/// #     type DeliveryTag = u64;
/// #     fn name(&self) -> &str { "my-queue" }
/// #     async fn poll(&self) -> Result<Option<MessageEnvelope<String, u64>>, Self::Error> { Ok(None) }
/// #     async fn ack(&self, _: u64, _: bool) -> Result<(), Self::Error> { Ok(()) }
/// #     async fn nack(&self, _: u64, _: bool, _: bool) -> Result<(), Self::Error> { Ok(()) }
/// #     async fn reject(&self, _: u64, _: bool) -> Result<(), Self::Error> { Ok(()) }
/// # }
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let handler = CallbackHandler::<MyQueue, _>::new(|envelope: &MessageEnvelope<String, u64>, _queue: &MyQueue, _consumer| {
///     println!("got {}", envelope.payload);
///     Ok(Directive::Defer)
/// });
///
/// let mut consumer = MultiQueueConsumer::with_defaults(vec![MyQueue, MyQueue], handler)?
///     .with_block_size(50)
///     .with_idle_timeout(Duration::from_secs(2));
///
/// // Stop after 1000 consumed deliveries
/// let stats = consumer.consume(1000).await?;
/// println!("acked {}", stats.acked);
/// # Ok(())
/// # }
/// ```
pub struct MultiQueueConsumer<Q: MessageQueue, H> {
    queues: Vec<Q>,
    handler: H,
    config: ConsumerConfig,
    shutdown: ShutdownHandle,
    state: ConsumerState<Q::DeliveryTag>,
}

impl<Q, H> MultiQueueConsumer<Q, H>
where
    Q: MessageQueue,
{
    /// Create a consumer over `queues`, visited in the given order
    ///
    /// Fails when `queues` is empty or the block size is zero.
    pub fn new(
        queues: Vec<Q>,
        handler: H,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError<Q::Error>> {
        if queues.is_empty() {
            return Err(ConsumerError::NoQueues);
        }
        config.validate()?;

        let state = ConsumerState::new(queues.len());

        Ok(Self {
            queues,
            handler,
            config,
            shutdown: ShutdownHandle::new(),
            state,
        })
    }

    /// Create a consumer with default configuration
    pub fn with_defaults(queues: Vec<Q>, handler: H) -> Result<Self, ConsumerError<Q::Error>> {
        Self::new(queues, handler, ConsumerConfig::default())
    }

    /// Set the block size (builder pattern)
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Set the idle timeout (builder pattern)
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the empty-lap wait (builder pattern)
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    /// Enable or disable stopping on OS signals (builder pattern)
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    /// Handle for stopping the consumer from another task or thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Ask the consumer to stop at the end of the current lap
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Current configuration, including any builder overrides
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// The queues in visiting order
    pub fn queues(&self) -> &[Q] {
        &self.queues
    }

    /// The delivery handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Deliveries waiting for the next flush, over all queues
    pub fn unacked_count(&self) -> usize {
        self.state.unacked_count()
    }

    /// Totals of the current (or last) run
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            consumed: self.state.consumed_count,
            ..self.state.stats
        }
    }

    /// Nack every pending delivery, one cumulative nack per queue.
    ///
    /// Meant for callers cleaning up after [`consume`](Self::consume) returned a queue
    /// error. Returns the number of deliveries nacked.
    pub async fn nack_all(&mut self, requeue: bool) -> Result<usize, ConsumerError<Q::Error>> {
        let nacked = self.settle(Settlement::Nack { requeue }).await?;
        if nacked > 0 {
            tracing::warn!(nacked, requeue, "nacked pending batch");
        }

        Ok(nacked)
    }

    /// Cumulatively ack every pending delivery, bypassing the flush callback
    async fn ack(&mut self) -> Result<(), ConsumerError<Q::Error>> {
        let acked = self.settle(Settlement::Ack).await?;
        self.state.last_ack_at = Some(Instant::now());
        tracing::debug!(acked, "acknowledged pending batch");

        Ok(())
    }

    /// Send one cumulative ack or nack per queue with pending deliveries.
    ///
    /// A queue's batch is cleared and counted in the stats once the broker accepted the
    /// call, so a failure leaves the remaining batches in place.
    async fn settle(&mut self, settlement: Settlement) -> Result<usize, ConsumerError<Q::Error>> {
        let mut settled = 0;

        for index in 0..self.queues.len() {
            let Some(batch) = &self.state.pending[index] else {
                continue;
            };
            let delivery_tag = batch.last_tag.clone();
            let count = batch.count;
            let queue = &self.queues[index];

            tracing::trace!(
                queue = queue.name(),
                delivery_tag = ?delivery_tag,
                count,
                ?settlement,
                "settling batch"
            );

            let result = match settlement {
                Settlement::Ack => queue.ack(delivery_tag, true).await,
                Settlement::Nack { requeue } => queue.nack(delivery_tag, true, requeue).await,
            };
            result.map_err(ConsumerError::Queue)?;

            self.state.pending[index] = None;
            match settlement {
                Settlement::Ack => self.state.stats.acked += count as u64,
                Settlement::Nack { .. } => self.state.stats.nacked += count as u64,
            }
            settled += count;
        }

        Ok(settled)
    }

    fn consumer_handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            shutdown: self.shutdown.clone(),
            queue_index: self.state.queue_index,
            consumed_count: self.state.consumed_count,
            unacked_count: self.state.unacked_count(),
            last_message_at: self.state.last_message_at,
        }
    }
}

impl<Q, H> MultiQueueConsumer<Q, H>
where
    Q: MessageQueue,
    H: DeliveryHandler<Q>,
{
    /// Consume until shut down or until `target` deliveries were consumed (0 = no limit).
    ///
    /// Only deliveries answered with [`Directive::Ack`] or [`Directive::Defer`] count
    /// towards `target`. When the loop stops, whatever is still pending is flushed before
    /// returning.
    ///
    /// # Errors
    ///
    /// Handler failures never end the run. A failing broker call does: the error is
    /// returned as [`ConsumerError::Queue`] and deliveries still pending stay unsettled.
    #[tracing::instrument(skip(self), fields(queues = self.queues.len()))]
    pub async fn consume(&mut self, target: u64) -> Result<ConsumerStats, ConsumerError<Q::Error>> {
        self.config.validate()?;
        self.state.reset(target);

        tracing::info!(
            block_size = self.config.block_size,
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "starting consumer"
        );

        let signal_listener = self
            .config
            .handle_signals
            .then(|| SignalListener::spawn(self.shutdown.clone()));

        let result = self.run_laps().await;

        drop(signal_listener);

        if let Err(e) = result {
            tracing::error!(
                error = %e,
                unacked = self.state.unacked_count(),
                "consumer stopped on queue error"
            );
            return Err(e);
        }

        self.flush_batch().await?;

        let stats = self.stats();
        tracing::info!(
            consumed = stats.consumed,
            acked = stats.acked,
            nacked = stats.nacked,
            rejected = stats.rejected,
            laps = stats.laps,
            "consumer stopped"
        );

        Ok(stats)
    }

    async fn run_laps(&mut self) -> Result<(), ConsumerError<Q::Error>> {
        let queue_count = self.queues.len();
        let mut index = 0;

        loop {
            self.state.queue_index = index;
            if self.state.last_ack_at.is_none() {
                self.state.last_ack_at = Some(Instant::now());
            }

            let polled = self.queues[index]
                .poll()
                .await
                .map_err(ConsumerError::Queue)?;

            match polled {
                Some(envelope) => {
                    let directive = self.handle_delivery(&envelope).await;
                    self.handle_directive(envelope.delivery_tag, directive)
                        .await?;
                }
                None if index == 0 => {
                    tracing::debug!(
                        wait_ms = self.config.wait_timeout.as_millis() as u64,
                        "first queue empty, waiting"
                    );
                    tokio::time::sleep(self.config.wait_timeout).await;
                }
                None => {}
            }

            if self.state.should_flush(&self.config, Instant::now()) {
                self.flush_batch().await?;
            }

            // Give the signal listener a chance to run on single-threaded runtimes
            if self.config.handle_signals {
                tokio::task::yield_now().await;
            }

            if index + 1 == queue_count {
                self.state.stats.laps += 1;
            }

            if !self.shutdown.is_running() || self.state.target_reached() {
                return Ok(());
            }

            index = (index + 1) % queue_count;
        }
    }

    /// Run the delivery callback; errors and panics become [`Directive::Reject`]
    async fn handle_delivery(
        &self,
        envelope: &MessageEnvelope<Q::Payload, Q::DeliveryTag>,
    ) -> Directive {
        let consumer = self.consumer_handle();
        let queue = &self.queues[self.state.queue_index];

        let outcome = AssertUnwindSafe(async {
            self.handler
                .handle_delivery(envelope, queue, &consumer)
                .await
        })
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(directive)) => directive,
            Ok(Err(e)) => {
                self.handle_exception(&e, &consumer);
                Directive::Reject
            }
            Err(payload) => {
                let e: HandlerError = Box::new(HandlerPanic::from_payload(payload));
                self.handle_exception(&e, &consumer);
                Directive::Reject
            }
        }
    }

    async fn handle_directive(
        &mut self,
        delivery_tag: Q::DeliveryTag,
        directive: Directive,
    ) -> Result<(), ConsumerError<Q::Error>> {
        let index = self.state.queue_index;

        match directive {
            Directive::Reject | Directive::RejectRequeue => {
                let requeue = directive == Directive::RejectRequeue;

                // Settle earlier deliveries first so the reject is never folded into an ack
                self.flush_batch().await?;

                let queue = &self.queues[index];
                tracing::warn!(
                    queue = queue.name(),
                    delivery_tag = ?delivery_tag,
                    requeue,
                    "rejecting message"
                );
                queue
                    .reject(delivery_tag, requeue)
                    .await
                    .map_err(ConsumerError::Queue)?;
                self.state.stats.rejected += 1;
            }
            Directive::Ack => {
                self.state.record(index, delivery_tag);
                self.ack().await?;
            }
            Directive::Defer => {
                tracing::trace!(
                    queue = self.queues[index].name(),
                    delivery_tag = ?delivery_tag,
                    "deferring ack"
                );
                self.state.record(index, delivery_tag);
            }
        }

        Ok(())
    }

    /// Commit the pending batch through the flush callback, then ack it or nack it.
    async fn flush_batch(&mut self) -> Result<(), ConsumerError<Q::Error>> {
        if !self.state.has_pending() {
            return Ok(());
        }

        if self.flush_deferred().await {
            self.ack().await
        } else {
            self.nack_all(false).await.map(|_| ())
        }
    }

    async fn flush_deferred(&self) -> bool {
        let consumer = self.consumer_handle();

        let outcome = AssertUnwindSafe(async { self.handler.flush_deferred(&consumer).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(committed)) => {
                if !committed {
                    tracing::warn!(
                        unacked = consumer.unacked_count(),
                        "flush callback declined batch"
                    );
                }
                committed
            }
            Ok(Err(e)) => {
                self.handle_exception(&e, &consumer);
                false
            }
            Err(payload) => {
                let e: HandlerError = Box::new(HandlerPanic::from_payload(payload));
                self.handle_exception(&e, &consumer);
                false
            }
        }
    }

    fn handle_exception(&self, error: &HandlerError, consumer: &ConsumerHandle) {
        self.handler.handle_error(error, consumer);
    }
}
