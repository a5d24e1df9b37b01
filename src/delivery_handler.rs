//! This module provides the trait that decides what happens to each delivery, and the
//! [`Directive`] it answers with.

use crate::{ConsumerHandle, HandlerError, MessageEnvelope, MessageQueue};

/// What the consumer should do with a delivery once the handler is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directive {
    /// Count the message and acknowledge the whole pending batch right away.
    Ack,
    /// Settle the pending batch, then reject this message without requeue.
    Reject,
    /// Settle the pending batch, then reject this message and ask the broker to redeliver it.
    RejectRequeue,
    /// Count the message and leave it unacknowledged until the batch is flushed.
    #[default]
    Defer,
}

impl From<bool> for Directive {
    /// `true` acknowledges, `false` rejects.
    fn from(value: bool) -> Self {
        if value {
            Directive::Ack
        } else {
            Directive::Reject
        }
    }
}

impl From<Option<bool>> for Directive {
    /// `None` defers.
    fn from(value: Option<bool>) -> Self {
        value.map_or(Directive::Defer, Directive::from)
    }
}

impl From<()> for Directive {
    fn from(_: ()) -> Self {
        Directive::Defer
    }
}

/// A trait for handlers that process deliveries and take part in batch flushes.
///
/// Implement this trait to put your business logic behind a
/// [`MultiQueueConsumer`](crate::MultiQueueConsumer). Only
/// [`handle_delivery`](DeliveryHandler::handle_delivery) is required.
///
/// # Error Handling
///
/// Returning an error (or panicking) never stops the consumer. A failed delivery is
/// rejected without requeue, a failed flush nacks the pending batch, and in both cases
/// [`handle_error`](DeliveryHandler::handle_error) is called exactly once.
///
/// # Timeouts
///
/// Callbacks are awaited without a timeout. A handler that never completes stalls every
/// queue the consumer owns.
///
/// # Examples
///
/// ```rust
/// use castor::{ConsumerHandle, DeliveryHandler, Directive, HandlerError, MessageEnvelope, MessageQueue};
///
/// struct PrintHandler;
///
/// impl<Q> DeliveryHandler<Q> for PrintHandler
/// where
///     Q: MessageQueue<Payload = String> + Sync,
/// {
///     async fn handle_delivery(
///         &self,
///         envelope: &MessageEnvelope<String, Q::DeliveryTag>,
///         queue: &Q,
///         _consumer: &ConsumerHandle,
///     ) -> Result<Directive, HandlerError> {
///         println!("{}: {}", queue.name(), envelope.payload);
///
///         if envelope.payload.is_empty() {
///             return Err("empty message".into());
///         }
///
///         Ok(Directive::Defer)
///     }
/// }
/// ```
pub trait DeliveryHandler<Q: MessageQueue> {
    /// Process a single delivery polled from `queue`.
    ///
    /// # Returns
    ///
    /// * `Ok(directive)` - How the consumer settles this delivery
    /// * `Err(HandlerError)` - Processing failed, the delivery is rejected without requeue
    fn handle_delivery(
        &self,
        envelope: &MessageEnvelope<Q::Payload, Q::DeliveryTag>,
        queue: &Q,
        consumer: &ConsumerHandle,
    ) -> impl Future<Output = Result<Directive, HandlerError>> + Send;

    /// Commit the side effects of the deferred batch before it is acknowledged.
    ///
    /// `Ok(true)` acknowledges the batch; `Ok(false)` or an error nacks it. The default
    /// has nothing to commit and always succeeds.
    fn flush_deferred(
        &self,
        _consumer: &ConsumerHandle,
    ) -> impl Future<Output = Result<bool, HandlerError>> + Send {
        async { Ok(true) }
    }

    /// Called once for every failed delivery or flush. The default logs the error.
    fn handle_error(&self, error: &HandlerError, consumer: &ConsumerHandle) {
        tracing::error!(
            error = %error,
            queue_index = consumer.queue_index(),
            consumed = consumer.consumed_count(),
            "message handling failed"
        );
    }
}
