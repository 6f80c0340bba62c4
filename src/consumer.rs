//! Consumer: prefetch-bounded receive loop with explicit acknowledgment.
//!
//! Deliveries are pulled one at a time and handed to an [`OrderHandler`].
//! A delivery is acknowledged only after the handler returns `Ok`. If the
//! handler fails, the loop stops and the session is closed, which returns
//! the delivery to the queue for another attempt (at-least-once).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::broker::bootstrap::open_session;
use crate::broker::{Delivery, DeliveryStream, QueueSpec, Session, Transport};
use crate::config::{Credentials, Endpoint};
use crate::error::{Error, Result};
use crate::model::Order;
use crate::telemetry::delivery::{record_state_transition, start_delivery_span};
use crate::telemetry::metrics;

/// Timestamp format for receive/processed log lines.
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// The unit of work performed for each order.
#[async_trait]
pub trait OrderHandler: Send + Sync {
    /// Do the work. Returning `Err` leaves the delivery unacknowledged.
    async fn handle(&self, order: &Order, delivery: &Delivery) -> Result<()>;
}

/// Logs the order and waits a fixed time, standing in for real work.
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    pub delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl OrderHandler for SimulatedWork {
    async fn handle(&self, order: &Order, delivery: &Delivery) -> Result<()> {
        info!(
            tag = %delivery.tag(),
            redelivered = delivery.redelivered(),
            "{} received {order}",
            Utc::now().format(LOG_TIME_FORMAT)
        );
        tokio::time::sleep(self.delay).await;
        info!(
            tag = %delivery.tag(),
            "{} order processed",
            Utc::now().format(LOG_TIME_FORMAT)
        );
        Ok(())
    }
}

/// Stops a running consumer between deliveries.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<Notify>);

impl Shutdown {
    /// Request shutdown. An in-flight delivery is finished and acknowledged first.
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

/// Totals for one consumer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReport {
    pub acked: usize,
    /// Malformed payloads discarded without requeue.
    pub rejected: usize,
}

/// How a single delivery ended.
enum Settled {
    Acked,
    Rejected,
}

/// Owns one session and consumes from one queue.
pub struct Consumer<S: Session> {
    session: S,
    queue: String,
    consumer_tag: String,
    shutdown: Shutdown,
}

impl<S: Session> Consumer<S> {
    /// Wrap a session whose queue is already declared.
    pub fn new(session: S, queue: impl Into<String>) -> Self {
        Self {
            session,
            queue: queue.into(),
            consumer_tag: format!("orderq-{}", uuid::Uuid::new_v4()),
            shutdown: Shutdown::default(),
        }
    }

    /// Connect, declare the queue and apply the prefetch limit.
    pub async fn connect<T>(
        transport: &T,
        endpoint: &Endpoint,
        credentials: &Credentials,
        spec: &QueueSpec,
        prefetch: u16,
    ) -> Result<Self>
    where
        T: Transport<Session = S>,
    {
        let session = open_session(transport, endpoint, credentials, spec).await?;
        let consumer = Self::new(session, spec.name.clone());
        if let Err(e) = consumer.set_prefetch(prefetch).await {
            if let Err(close_err) = consumer.close().await {
                warn!("closing session after failed qos: {close_err}");
            }
            return Err(e);
        }
        Ok(consumer)
    }

    /// Cap delivered-but-unacknowledged messages for this consumer.
    pub async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.session.set_prefetch(count).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", "prefetch"),
            ],
        );
        info!(queue = %self.queue, prefetch = count, "prefetch set");
        Ok(())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Handle for stopping [`Consumer::run`] from elsewhere.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Consume until shutdown, end of stream or a fatal error, then close
    /// the session. Anything unacknowledged at that point is requeued by
    /// the broker.
    pub async fn run<H: OrderHandler>(self, handler: &H) -> Result<ConsumeReport> {
        let outcome = self.consume(handler).await;
        if let Err(e) = self.close().await {
            warn!("closing consumer session: {e}");
        }
        outcome
    }

    /// The receive loop. Leaves the session open.
    pub async fn consume<H: OrderHandler>(&self, handler: &H) -> Result<ConsumeReport> {
        let mut deliveries = self.session.subscribe(&self.queue, &self.consumer_tag).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", "subscribe"),
            ],
        );
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "waiting for orders");

        let mut report = ConsumeReport::default();
        loop {
            // Only the wait is cancellable; a delivery in hand is always finished.
            // Shutdown is checked first so a ready delivery cannot win the race.
            let next = tokio::select! {
                biased;
                _ = self.shutdown.0.notified() => {
                    info!("consumer shutting down");
                    return Ok(report);
                }
                next = deliveries.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => {
                    info!(queue = %self.queue, "delivery stream ended");
                    return Ok(report);
                }
            };

            match self.process(handler, delivery).await? {
                Settled::Acked => report.acked += 1,
                Settled::Rejected => report.rejected += 1,
            }
        }
    }

    /// Decode, work, settle. `Err` means the delivery was left unacknowledged.
    async fn process<H: OrderHandler>(&self, handler: &H, delivery: Delivery) -> Result<Settled> {
        let span = start_delivery_span(&self.queue, delivery.tag(), delivery.redelivered());
        metrics::deliveries().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("redelivered", delivery.redelivered()),
            ],
        );

        async {
            let order = match Order::from_json(delivery.payload()) {
                Ok(order) => order,
                Err(e) => {
                    // No dead-letter target: a malformed body can never succeed.
                    warn!(tag = %delivery.tag(), "discarding delivery: {e}");
                    record_state_transition(&span, "delivered", "rejected");
                    self.session.reject(delivery, false).await?;
                    self.count_outcome("rejected");
                    return Ok(Settled::Rejected);
                }
            };

            record_state_transition(&span, "delivered", "processing");
            let started = Instant::now();
            if let Err(e) = handler.handle(&order, &delivery).await {
                error!(tag = %delivery.tag(), "processing failed, leaving unacknowledged: {e}");
                self.count_outcome("abandoned");
                return Err(match e {
                    Error::Processing(_) => e,
                    other => Error::Processing(other.to_string()),
                });
            }
            metrics::processing_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("queue", self.queue.clone())],
            );

            self.session.ack(delivery).await?;
            record_state_transition(&span, "processing", "acknowledged");
            self.count_outcome("acked");
            Ok(Settled::Acked)
        }
        .instrument(span.clone())
        .await
    }

    fn count_outcome(&self, outcome: &'static str) {
        metrics::delivery_outcomes().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub async fn close(self) -> Result<()> {
        self.session.close().await
    }
}
