//! Delivery span helpers.
//!
//! One span per delivery, covering decode, work and settlement.

use tracing::Span;

use crate::broker::DeliveryTag;

/// Start a span for processing one delivery.
///
/// The `delivery.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_delivery_span(queue: &str, tag: DeliveryTag, redelivered: bool) -> Span {
    tracing::info_span!(
        "delivery.process",
        "messaging.destination.name" = queue,
        "delivery.tag" = tag.0,
        "delivery.redelivered" = redelivered,
        "delivery.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the delivery span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("delivery.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}

/// Start a span for publishing one order.
pub fn start_publish_span(queue: &str, seq: usize) -> Span {
    tracing::info_span!("order.publish", "messaging.destination.name" = queue, seq)
}
