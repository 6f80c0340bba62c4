//! Session bootstrap shared by producer and consumer.
//!
//! Either side may run first, so both declare the queue with the same
//! parameters before doing anything else.

use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::{QueueSpec, Session, Transport};
use crate::config::{Credentials, Endpoint};
use crate::error::Result;
use crate::telemetry::metrics;

/// Connect to the broker.
pub async fn connect<T: Transport>(
    transport: &T,
    endpoint: &Endpoint,
    credentials: &Credentials,
) -> Result<T::Session> {
    info!(%endpoint, user = %credentials.username, "connecting to broker");
    transport.connect(endpoint, credentials).await
}

/// Declare the queue (idempotent).
pub async fn ensure_queue<S: Session>(session: &S, spec: &QueueSpec) -> Result<()> {
    session.declare_queue(spec).await?;
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", spec.name.clone()),
            KeyValue::new("operation", "declare"),
        ],
    );
    info!(
        queue = %spec.name,
        durable = spec.durable,
        delivery_limit = ?spec.delivery_limit,
        "queue declared"
    );
    Ok(())
}

/// Connect and declare. On a failed declaration the session is closed
/// before the error is returned.
pub async fn open_session<T: Transport>(
    transport: &T,
    endpoint: &Endpoint,
    credentials: &Credentials,
    spec: &QueueSpec,
) -> Result<T::Session> {
    let session = connect(transport, endpoint, credentials).await?;
    if let Err(e) = ensure_queue(&session, spec).await {
        if let Err(close_err) = session.close().await {
            warn!("closing session after failed declare: {close_err}");
        }
        return Err(e);
    }
    Ok(session)
}
