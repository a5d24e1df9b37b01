//! Error types for the consumer and its callbacks.

/// Error type returned by user callbacks.
///
/// Delivery and flush callbacks may fail with any error type; the consumer never propagates
/// these. They are routed to [`DeliveryHandler::handle_error`](crate::DeliveryHandler::handle_error)
/// and turned into a reject (delivery) or nack (flush).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that stop a consumer.
///
/// `E` is the error type of the underlying [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError<E> {
    #[error("consumer requires at least one queue")]
    NoQueues,

    #[error("block size must be at least 1")]
    InvalidBlockSize,

    /// The broker rejected or failed an operation. The pending batch is left untouched so
    /// the caller can decide what to do with it (see
    /// [`MultiQueueConsumer::nack_all`](crate::MultiQueueConsumer::nack_all)).
    #[error("queue operation failed: {0}")]
    Queue(E),
}

/// A callback panicked while handling a delivery or flushing a batch.
#[derive(Debug, thiserror::Error)]
#[error("callback panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self { message }
    }
}
