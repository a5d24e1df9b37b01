#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use castor::{
    CallbackHandler, ConsumerHandle, Directive, HandlerError, MessageEnvelope, MessageQueue,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Poll {
        queue: String,
        delivered: Option<u64>,
    },
    Ack {
        queue: String,
        tag: u64,
        multiple: bool,
    },
    Nack {
        queue: String,
        tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Reject {
        queue: String,
        tag: u64,
        requeue: bool,
    },
}

pub fn poll(queue: &str, delivered: Option<u64>) -> Call {
    Call::Poll {
        queue: queue.to_string(),
        delivered,
    }
}

pub fn ack(queue: &str, tag: u64) -> Call {
    Call::Ack {
        queue: queue.to_string(),
        tag,
        multiple: true,
    }
}

pub fn nack(queue: &str, tag: u64, requeue: bool) -> Call {
    Call::Nack {
        queue: queue.to_string(),
        tag,
        multiple: true,
        requeue,
    }
}

pub fn reject(queue: &str, tag: u64, requeue: bool) -> Call {
    Call::Reject {
        queue: queue.to_string(),
        tag,
        requeue,
    }
}

/// Broker calls shared by every mock queue of a test, in the order they happened
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(Instant, Call)>>>,
}

impl CallLog {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    /// Every ack, nack and reject, without the polls
    pub fn settlements(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Poll { .. }))
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Poll { .. }))
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("mock broker error: {0}")]
pub struct MockError(pub String);

pub struct MockQueue {
    name: String,
    log: CallLog,
    tags: Mutex<VecDeque<u64>>,
    endless_from: Mutex<Option<u64>>,
    fail_poll_after: Option<usize>,
    fail_acks: bool,
    polls: AtomicUsize,
}

impl MockQueue {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            tags: Mutex::new(VecDeque::new()),
            endless_from: Mutex::new(None),
            fail_poll_after: None,
            fail_acks: false,
            polls: AtomicUsize::new(0),
        }
    }

    /// Deliver these tags, in order, then report an empty queue
    pub fn with_tags(self, tags: impl IntoIterator<Item = u64>) -> Self {
        self.tags.lock().unwrap().extend(tags);
        self
    }

    /// Never run dry: deliver `start`, `start + 1`, ...
    pub fn endless(self, start: u64) -> Self {
        *self.endless_from.lock().unwrap() = Some(start);
        self
    }

    /// Fail every poll after the first `polls` ones
    pub fn failing_poll_after(mut self, polls: usize) -> Self {
        self.fail_poll_after = Some(polls);
        self
    }

    /// Refuse every ack, without logging it
    pub fn failing_acks(mut self) -> Self {
        self.fail_acks = true;
        self
    }

    fn next_tag(&self) -> Option<u64> {
        if let Some(tag) = self.tags.lock().unwrap().pop_front() {
            return Some(tag);
        }

        self.endless_from.lock().unwrap().as_mut().map(|next| {
            let tag = *next;
            *next += 1;
            tag
        })
    }
}

impl MessageQueue for MockQueue {
    type Error = MockError;
    type Payload = String;
    type DeliveryTag = u64;

    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Option<MessageEnvelope<String, u64>>, MockError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_poll_after.is_some_and(|limit| polls >= limit) {
            return Err(MockError("connection reset".to_string()));
        }

        let delivered = self.next_tag();
        self.log.push(poll(&self.name, delivered));

        Ok(delivered.map(|tag| MessageEnvelope::new(format!("{}-{tag}", self.name), tag)))
    }

    async fn ack(&self, tag: u64, multiple: bool) -> Result<(), MockError> {
        if self.fail_acks {
            return Err(MockError("ack refused".to_string()));
        }

        self.log.push(Call::Ack {
            queue: self.name.clone(),
            tag,
            multiple,
        });
        Ok(())
    }

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<(), MockError> {
        self.log.push(Call::Nack {
            queue: self.name.clone(),
            tag,
            multiple,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<(), MockError> {
        self.log.push(Call::Reject {
            queue: self.name.clone(),
            tag,
            requeue,
        });
        Ok(())
    }
}

pub type DeliveryFn = Box<
    dyn Fn(&MessageEnvelope<String, u64>, &MockQueue, &ConsumerHandle) -> Result<Directive, HandlerError>
        + Send
        + Sync,
>;

pub type ScriptedHandler = CallbackHandler<MockQueue, DeliveryFn>;

/// Answer each delivery tag with the given directive, deferring everything else
pub fn scripted(directives: impl IntoIterator<Item = (u64, Directive)>) -> ScriptedHandler {
    let directives: HashMap<u64, Directive> = directives.into_iter().collect();

    let delivery: DeliveryFn = Box::new(move |envelope, _queue, _consumer| {
        Ok(directives
            .get(&envelope.delivery_tag)
            .copied()
            .unwrap_or_default())
    });

    CallbackHandler::<MockQueue, _>::new(delivery)
}

/// Counts calls made to a callback
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
