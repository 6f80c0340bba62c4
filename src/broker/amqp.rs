//! RabbitMQ over AMQP 0-9-1 via lapin.
//!
//! One connection with one channel per session. The channel runs in
//! publisher-confirm mode so a publish returns only once the broker has
//! taken responsibility for the message (or returned it as unroutable).

use async_trait::async_trait;
use futures::StreamExt as _;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use super::{Delivery, DeliveryStream, DeliveryTag, PublishOptions, QueueSpec, Session, Transport};
use crate::config::secrets::ExposeSecret;
use crate::config::{Credentials, Endpoint};
use crate::error::{Error, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;
/// `delivery_mode` value marking a message persistent.
const PERSISTENT: u8 = 2;

/// Connects to RabbitMQ.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    type Session = AmqpSession;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<AmqpSession> {
        let uri = AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: credentials.username.clone(),
                    password: credentials.password.expose_secret().to_string(),
                },
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
            vhost: endpoint.vhost.clone(),
            ..Default::default()
        };

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(format!("{endpoint}: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(format!("{endpoint}: cannot open channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        debug!(%endpoint, channel = channel.id(), "amqp session opened");
        Ok(AmqpSession {
            connection,
            channel,
        })
    }
}

/// An AMQP connection and its single channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Delete a queue and any messages still in it. Returns the number of
    /// messages dropped.
    pub async fn delete_queue(&self, queue: &str) -> Result<u32> {
        let purged = self
            .channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        debug!(queue, purged, "queue deleted");
        Ok(purged)
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(limit) = spec.delivery_limit {
        // Delivery limits are only enforced by quorum queues.
        args.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString(LongString::from("quorum")),
        );
        args.insert(
            ShortString::from("x-delivery-limit"),
            AMQPValue::LongInt(i32::try_from(limit).unwrap_or(i32::MAX)),
        );
    }
    args
}

/// Map a declaration failure. A mismatch is reported by the broker as
/// PRECONDITION_FAILED, a foreign exclusive queue as RESOURCE_LOCKED.
fn declare_error(queue: &str, err: lapin::Error) -> Error {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                    | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED)
            ) =>
        {
            Error::QueueConflict {
                queue: queue.to_string(),
                reason: amqp.to_string(),
            }
        }
        _ => Error::Amqp(err),
    }
}

#[async_trait]
impl Session for AmqpSession {
    type Deliveries = AmqpDeliveries;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };
        self.channel
            .queue_declare(&spec.name, options, queue_arguments(spec))
            .await
            .map_err(|e| declare_error(&spec.name, e))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from("application/json"));
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;

        match confirm {
            // A returned message is still acked, but nothing was stored.
            Confirmation::Ack(Some(returned)) => {
                warn!(queue, reply = %returned.reply_text, "publish returned by broker");
                Err(Error::Unroutable {
                    queue: queue.to_string(),
                })
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(Error::PublishNotConfirmed {
                queue: queue.to_string(),
            }),
        }
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<AmqpDeliveries> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(AmqpDeliveries { consumer })
    }

    async fn ack(&self, delivery: Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.tag().0, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: Delivery, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery.tag().0, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        // The broker requeues anything still unacked once the channel closes.
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "bye").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "bye").await?;
        }
        Ok(())
    }
}

/// Receive side of an AMQP consumer.
pub struct AmqpDeliveries {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|d| Delivery::new(DeliveryTag(d.delivery_tag), d.data, d.redelivered))
                .map_err(Error::from),
        )
    }
}
