//! Broker seam: connect, declare, publish, receive, acknowledge.
//!
//! The broker is an external collaborator. [`amqp`] talks to RabbitMQ over
//! AMQP 0-9-1; [`memory`] is an in-process broker with the same delivery
//! contract, used for tests and local runs.

pub mod amqp;
pub mod bootstrap;
pub mod memory;

use crate::config::{Credentials, Endpoint};
use crate::error::Result;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Declaration parameters for a queue. Two declarations of the same name are
/// compatible only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring session, deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Times a message may be returned to the queue before the broker drops
    /// it. None means unlimited redelivery.
    pub delivery_limit: Option<u32>,
}

impl QueueSpec {
    /// A durable, shared, long-lived work queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            delivery_limit: None,
        }
    }

    /// Cap total deliveries per message. `Some(n)` allows the first delivery
    /// plus `n - 1` redeliveries.
    pub fn max_deliveries(mut self, max: Option<u32>) -> Self {
        self.delivery_limit = max.map(|n| n.saturating_sub(1));
        self
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Per-session delivery sequence number assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer. Acknowledging or rejecting consumes it,
/// so each tag is settled at most once.
#[derive(Debug)]
pub struct Delivery {
    tag: DeliveryTag,
    payload: Vec<u8>,
    redelivered: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, payload: Vec<u8>, redelivered: bool) -> Self {
        Self {
            tag,
            payload,
            redelivered,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True if this message was delivered before and never acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}

/// How a message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Written to disk by the broker, survives restarts of a durable queue.
    pub persistent: bool,
    /// Fail with `Unroutable` instead of dropping when no queue matches.
    pub mandatory: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            mandatory: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Opens sessions against a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    type Session: Session;

    /// Fails with `Error::Connection` if the broker is unreachable or rejects
    /// the credentials.
    async fn connect(&self, endpoint: &Endpoint, credentials: &Credentials)
    -> Result<Self::Session>;
}

/// A connection plus channel, owned by exactly one producer or consumer.
///
/// Closing (or dropping) a session returns its unacknowledged deliveries to
/// their queues.
#[async_trait]
pub trait Session: Send + Sync {
    type Deliveries: DeliveryStream;

    /// Idempotent. `Error::QueueConflict` if the queue exists with other settings.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Cap delivered-but-unacknowledged messages for this session. 0 = no cap.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish to the named queue via the default exchange and wait for the
    /// broker's confirm.
    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()>;

    /// Start receiving from a queue with manual acknowledgment.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Self::Deliveries>;

    /// Retire a delivery (`multiple = false`).
    async fn ack(&self, delivery: Delivery) -> Result<()>;

    /// Refuse a delivery, either back to the queue or discarded.
    async fn reject(&self, delivery: Delivery, requeue: bool) -> Result<()>;

    /// Close channel and connection.
    async fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Pull-based receive side of a subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `None` once the subscription has ended.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}
