//! This module provides the trait a broker queue implements to be consumed by a
//! [`MultiQueueConsumer`](crate::MultiQueueConsumer).

/// A delivered message together with the tag the broker assigned to it.
///
/// The consumer only looks at the tag; the payload is handed to the
/// [`DeliveryHandler`](crate::DeliveryHandler) untouched.
#[derive(Debug, Clone)]
pub struct MessageEnvelope<P, T> {
    /// The message body and whatever metadata the queue implementation chooses to carry
    pub payload: P,
    /// Broker-assigned delivery tag, orderable within one queue
    pub delivery_tag: T,
}

impl<P, T> MessageEnvelope<P, T> {
    /// Create a new message envelope
    pub fn new(payload: P, delivery_tag: T) -> Self {
        Self {
            payload,
            delivery_tag,
        }
    }
}

/// A queue the consumer can poll and settle deliveries on.
///
/// Implement this trait to plug a broker into the consumer (an AMQP channel bound to a
/// queue name, for example). Every method maps onto one broker call; the consumer decides
/// when to call them.
///
/// `multiple` on [`ack`](MessageQueue::ack) and [`nack`](MessageQueue::nack) means
/// cumulative: settle the given tag and every earlier unsettled delivery on this queue.
/// Delivery tags must therefore be scoped to a single queue. With AMQP, where tags are
/// scoped to the channel, give every queue its own channel.
///
/// # Examples
///
/// ```rust
/// use castor::{MessageEnvelope, MessageQueue};
///
/// struct NullQueue;
///
/// impl MessageQueue for NullQueue {
///     type Error = std::io::Error;
///     type Payload = Vec<u8>;
///     type DeliveryTag = u64;
///
///     fn name(&self) -> &str {
///         "null"
///     }
///
///     async fn poll(&self) -> Result<Option<MessageEnvelope<Vec<u8>, u64>>, Self::Error> {
///         Ok(None)
///     }
///
///     async fn ack(&self, _tag: u64, _multiple: bool) -> Result<(), Self::Error> {
///         Ok(())
///     }
///
///     async fn nack(&self, _tag: u64, _multiple: bool, _requeue: bool) -> Result<(), Self::Error> {
///         Ok(())
///     }
///
///     async fn reject(&self, _tag: u64, _requeue: bool) -> Result<(), Self::Error> {
///         Ok(())
///     }
/// }
/// ```
pub trait MessageQueue {
    /// The error returned by broker operations
    type Error: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static;
    /// The payload type of each message
    type Payload: Send + Sync + 'static;
    /// The broker's delivery tag type
    type DeliveryTag: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch at most one message without blocking.
    ///
    /// Returns `Ok(None)` when the queue is currently empty.
    #[allow(clippy::type_complexity)]
    fn poll(
        &self,
    ) -> impl Future<
        Output = Result<Option<MessageEnvelope<Self::Payload, Self::DeliveryTag>>, Self::Error>,
    > + Send;

    /// Acknowledge a delivery, or every delivery up to it when `multiple` is set.
    fn ack(
        &self,
        delivery_tag: Self::DeliveryTag,
        multiple: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Negatively acknowledge a delivery, or every delivery up to it when `multiple` is set.
    fn nack(
        &self,
        delivery_tag: Self::DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Reject a single delivery.
    fn reject(
        &self,
        delivery_tag: Self::DeliveryTag,
        requeue: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
