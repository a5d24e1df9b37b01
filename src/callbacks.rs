//! Closure-based [`DeliveryHandler`] for callers who would rather register callbacks than
//! implement the trait.

use std::marker::PhantomData;

use futures::future;

use crate::{ConsumerHandle, DeliveryHandler, Directive, HandlerError, MessageEnvelope, MessageQueue};

type FlushCallback = Box<dyn Fn(&ConsumerHandle) -> Result<bool, HandlerError> + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&HandlerError, &ConsumerHandle) + Send + Sync>;

/// A [`DeliveryHandler`] assembled from closures.
///
/// The delivery closure may answer with anything convertible into a [`Directive`]:
/// `true` acks, `false` rejects, `None` (or `()`) defers.
///
/// # Examples
///
/// ```rust
/// use castor::{CallbackHandler, ConsumerHandle, MessageEnvelope, MessageQueue};
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
///
/// let handler = CallbackHandler::<MyQueue, _>::new(
///     |envelope: &MessageEnvelope<String, u64>, _queue: &MyQueue, _consumer: &ConsumerHandle| {
///         // Ack urgent messages right away, batch the rest
///         Ok(envelope.payload.starts_with("urgent").then_some(true))
///     },
/// )
/// .on_flush(|consumer| {
///     println!("committing {} messages", consumer.unacked_count());
///     Ok(true)
/// })
/// .on_error(|error, _consumer| eprintln!("handler failed: {error}"));
/// ```
pub struct CallbackHandler<Q, D> {
    delivery: D,
    flush: Option<FlushCallback>,
    error: Option<ErrorCallback>,
    _queue: PhantomData<fn(&Q)>,
}

impl<Q, D> CallbackHandler<Q, D>
where
    Q: MessageQueue,
{
    /// Create a handler from a delivery callback
    pub fn new<R>(delivery: D) -> Self
    where
        D: Fn(&MessageEnvelope<Q::Payload, Q::DeliveryTag>, &Q, &ConsumerHandle) -> Result<R, HandlerError>,
        R: Into<Directive>,
    {
        Self {
            delivery,
            flush: None,
            error: None,
            _queue: PhantomData,
        }
    }

    /// Set the callback that commits a batch before it is acknowledged (builder pattern)
    ///
    /// Without one, every flush acknowledges.
    pub fn on_flush<F>(mut self, flush: F) -> Self
    where
        F: Fn(&ConsumerHandle) -> Result<bool, HandlerError> + Send + Sync + 'static,
    {
        self.flush = Some(Box::new(flush));
        self
    }

    /// Set the callback notified of failed deliveries and flushes (builder pattern)
    ///
    /// Without one, failures are logged.
    pub fn on_error<E>(mut self, error: E) -> Self
    where
        E: Fn(&HandlerError, &ConsumerHandle) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(error));
        self
    }
}

impl<Q, D, R> DeliveryHandler<Q> for CallbackHandler<Q, D>
where
    Q: MessageQueue,
    D: Fn(&MessageEnvelope<Q::Payload, Q::DeliveryTag>, &Q, &ConsumerHandle) -> Result<R, HandlerError>,
    R: Into<Directive>,
{
    fn handle_delivery(
        &self,
        envelope: &MessageEnvelope<Q::Payload, Q::DeliveryTag>,
        queue: &Q,
        consumer: &ConsumerHandle,
    ) -> impl Future<Output = Result<Directive, HandlerError>> + Send {
        future::ready((self.delivery)(envelope, queue, consumer).map(Into::into))
    }

    fn flush_deferred(
        &self,
        consumer: &ConsumerHandle,
    ) -> impl Future<Output = Result<bool, HandlerError>> + Send {
        let result = match &self.flush {
            Some(flush) => flush(consumer),
            None => Ok(true),
        };

        future::ready(result)
    }

    fn handle_error(&self, error: &HandlerError, consumer: &ConsumerHandle) {
        match &self.error {
            Some(callback) => callback(error, consumer),
            None => tracing::error!(
                error = %error,
                queue_index = consumer.queue_index(),
                "message handling failed"
            ),
        }
    }
}
