//! Error types for orderq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A required setting is missing or malformed. Raised before connecting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable or credentials rejected.
    #[error("connection error: {0}")]
    Connection(String),

    /// The queue already exists with different durability/exclusivity/auto-delete
    /// flags or arguments.
    #[error("queue {queue} exists with incompatible settings: {reason}")]
    QueueConflict { queue: String, reason: String },

    /// A mandatory publish could not be routed to any queue.
    #[error("message to queue {queue} is unroutable")]
    Unroutable { queue: String },

    /// The message body is not a valid order. Permanent, never retried.
    #[error("malformed payload: {0}")]
    Payload(String),

    /// The handler failed while working on a delivery.
    #[error("processing failed: {0}")]
    Processing(String),

    /// The broker refused or lost a publish (negative confirm).
    #[error("publish not confirmed for queue {queue}")]
    PublishNotConfirmed { queue: String },

    /// The session was already closed by the broker or the client.
    #[error("session closed")]
    SessionClosed,

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Per-message failures are logged and skipped; everything else stops the run.
    pub fn is_per_message(&self) -> bool {
        matches!(self, Error::Unroutable { .. } | Error::Payload(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
