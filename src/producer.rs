//! Producer: publishes orders as persistent, mandatory messages.
//!
//! Each publish waits for the broker's confirm, so once `publish` returns
//! `Ok` the order is durably enqueued. Nothing is rolled back if a later
//! publish fails.

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};

use crate::broker::bootstrap::open_session;
use crate::broker::{PublishOptions, QueueSpec, Session, Transport};
use crate::config::{Credentials, Endpoint, ProducerSettings};
use crate::error::{Error, Result};
use crate::model::Order;
use crate::telemetry::delivery::start_publish_span;
use crate::telemetry::metrics;

/// Totals for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Orders confirmed by the broker.
    pub published: usize,
    /// Orders the broker could not route to the queue.
    pub unroutable: usize,
}

/// Owns one session and publishes to one queue.
pub struct Producer<S: Session> {
    session: S,
    queue: String,
    options: PublishOptions,
}

impl<S: Session> Producer<S> {
    pub fn new(session: S, queue: impl Into<String>) -> Self {
        Self {
            session,
            queue: queue.into(),
            options: PublishOptions::default(),
        }
    }

    /// Connect, declare the queue and wrap the session.
    pub async fn connect<T>(
        transport: &T,
        endpoint: &Endpoint,
        credentials: &Credentials,
        spec: &QueueSpec,
    ) -> Result<Self>
    where
        T: Transport<Session = S>,
    {
        let session = open_session(transport, endpoint, credentials, spec).await?;
        Ok(Self::new(session, spec.name.clone()))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Serialize and publish one order. `Error::Unroutable` if the queue is missing.
    pub async fn publish(&self, order: &Order) -> Result<()> {
        let payload = order.to_json()?;
        let result = self
            .session
            .publish(&self.queue, &payload, self.options)
            .await;

        let label = match &result {
            Ok(()) => "ok",
            Err(Error::Unroutable { .. }) => "unroutable",
            Err(_) => "error",
        };
        metrics::orders_published().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("result", label),
            ],
        );

        result?;
        info!(
            customer = order.customer_id(),
            items = order.items().len(),
            bytes = payload.len(),
            "sent {}",
            String::from_utf8_lossy(&payload)
        );
        Ok(())
    }

    /// Publish `batch_count` orders, pausing `publish_interval` between them.
    ///
    /// Unroutable orders are counted and skipped; any other error stops the
    /// batch and is returned.
    pub async fn publish_batch(
        &self,
        settings: &ProducerSettings,
        mut next_order: impl FnMut() -> Order,
    ) -> Result<PublishReport> {
        let interval = settings.publish_interval();
        let mut report = PublishReport::default();

        for seq in 0..settings.batch_count {
            let order = next_order();
            match self
                .publish(&order)
                .instrument(start_publish_span(&self.queue, seq))
                .await
            {
                Ok(()) => report.published += 1,
                Err(e) if e.is_per_message() => {
                    warn!(seq, "{e}");
                    report.unroutable += 1;
                }
                Err(e) => {
                    error!(seq, published = report.published, "aborting batch: {e}");
                    return Err(e);
                }
            }

            if seq + 1 < settings.batch_count && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        info!(
            queue = %self.queue,
            published = report.published,
            unroutable = report.unroutable,
            "batch finished"
        );
        Ok(report)
    }

    /// Publish a batch, then close the session whatever the outcome.
    pub async fn run(
        self,
        settings: &ProducerSettings,
        next_order: impl FnMut() -> Order,
    ) -> Result<PublishReport> {
        let outcome = self.publish_batch(settings, next_order).await;
        if let Err(e) = self.close().await {
            warn!("closing producer session: {e}");
        }
        outcome
    }

    pub async fn close(self) -> Result<()> {
        self.session.close().await
    }
}
