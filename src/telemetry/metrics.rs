//! Metric instrument factories for orderq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"orderq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for orderq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("orderq")
}

/// Counter: publish attempts.
/// Labels: `queue`, `result` ("ok" | "unroutable" | "error").
pub fn orders_published() -> Counter<u64> {
    meter()
        .u64_counter("orderq.orders.published")
        .with_description("Number of orders published")
        .build()
}

/// Counter: deliveries received by consumers.
/// Labels: `queue`, `redelivered`.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("orderq.deliveries")
        .with_description("Number of deliveries received")
        .build()
}

/// Counter: how deliveries were settled.
/// Labels: `queue`, `outcome` ("acked" | "rejected" | "abandoned").
pub fn delivery_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("orderq.delivery.outcomes")
        .with_description("Number of deliveries by settlement")
        .build()
}

/// Counter: session-level queue operations (declare, prefetch, subscribe).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("orderq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `queue`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("orderq.processing.duration_ms")
        .with_description("Order processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
