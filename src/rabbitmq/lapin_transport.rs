// src/rabbitmq/lapin_transport.rs
// Transport seam implemented on top of lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, warn};

use super::errors::{BrokerError, Result};
use super::message::{AckHandle, Acknowledger, Delivery, Publishing};
use super::transport::{
    BrokerChannel, BrokerConnection, CloseListeners, CloseNotifier, ConfirmOutcome, Connector,
    DeliveryStream, PendingConfirm,
};
use crate::config::{ExchangeType, QueueConfig};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let properties =
            ConnectionProperties::default().with_connection_name(connection_name.into());

        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to connect: {}", e)))?;

        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

pub struct LapinConnection {
    connection: Connection,
    listeners: Arc<CloseListeners>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let listeners = Arc::new(CloseListeners::default());
        let on_error = listeners.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection error");
            on_error.fail(&err.to_string());
        });

        Self {
            connection,
            listeners,
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Created channel");
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn notify_close(&self) -> CloseNotifier {
        self.listeners.subscribe(!self.is_open())
    }

    async fn close(&self) -> Result<()> {
        self.listeners.finish();
        if self.is_open() {
            self.connection.close(REPLY_SUCCESS, "Closing connection").await?;
        }
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
    listeners: Arc<CloseListeners>,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        let listeners = Arc::new(CloseListeners::default());
        let on_error = listeners.clone();
        let channel_id = channel.id();
        channel.on_error(move |err| {
            debug!(channel_id, error = %err, "RabbitMQ channel error");
            on_error.fail(&err.to_string());
        });

        Self { channel, listeners }
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn queue_arguments(options: &QueueConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    if options.lazy {
        arguments.insert(
            "x-queue-mode".into(),
            AMQPValue::LongString("lazy".into()),
        );
    }
    arguments
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn notify_close(&self) -> CloseNotifier {
        self.listeners.subscribe(!self.is_open())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeType) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: &QueueConfig) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(options),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<PendingConfirm> {
        let properties = BasicProperties::default()
            .with_message_id(publishing.message_id.clone().into())
            .with_content_type(publishing.content_type.clone().into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &publishing.body,
                properties,
            )
            .await?;

        Ok(Box::pin(async move {
            let outcome = match confirm.await? {
                Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                    ConfirmOutcome::Returned
                }
                Confirmation::Ack(None) => ConfirmOutcome::Ack,
                Confirmation::Nack(None) => ConfirmOutcome::Nack,
                Confirmation::NotRequested => ConfirmOutcome::NotRequested,
            };
            Ok(outcome)
        }))
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let tag = consumer_tag.to_string();
        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| into_delivery(delivery, &tag))
                    .map_err(BrokerError::from)
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.listeners.finish();
        if self.is_open() {
            self.channel.close(REPLY_SUCCESS, "Closing channel").await?;
        }
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery, consumer_tag: &str) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string())
        .unwrap_or_default();

    let acker = AckHandle::new(
        delivery.delivery_tag,
        Arc::new(LapinAcknowledger {
            acker: delivery.acker,
        }),
    );

    Delivery::new(
        message_id,
        content_type,
        delivery.data,
        consumer_tag,
        delivery.redelivered,
        acker,
    )
}

/// lapin's acker already carries the delivery tag and channel.
struct LapinAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self, _delivery_tag: u64, multiple: bool) -> Result<()> {
        self.acker.ack(BasicAckOptions { multiple }).await?;
        Ok(())
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> Result<()> {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }
}
