// src/rabbitmq/transport.rs
// The seam between the resilient client and a concrete AMQP implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use super::errors::{BrokerError, Result};
use super::message::{Delivery, Publishing};
use crate::config::{ExchangeType, QueueConfig};

/// Stream of deliveries for one consumer tag. Ends when the subscription
/// is gone (channel or connection closed).
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Resolves once the broker settles a published message.
pub type PendingConfirm = BoxFuture<'static, Result<ConfirmOutcome>>;

/// Yields one error when the connection or channel closes unexpectedly,
/// then ends. Ends without an item on a graceful close.
pub type CloseNotifier = mpsc::UnboundedReceiver<BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The broker could not route a mandatory message and handed it back.
    Returned,
    /// The channel is not in confirm mode.
    NotRequested,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, uri: &str, connection_name: &str)
        -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    fn notify_close(&self) -> CloseNotifier;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    fn notify_close(&self) -> CloseNotifier;

    async fn confirm_select(&self) -> Result<()>;

    async fn exchange_declare(&self, name: &str, kind: ExchangeType) -> Result<()>;

    async fn queue_declare(&self, name: &str, options: &QueueConfig) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Publish persistent and mandatory.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<PendingConfirm>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Fan-out of close notifications to every `notify_close` subscriber.
#[derive(Debug, Default)]
pub(crate) struct CloseListeners {
    senders: std::sync::Mutex<Vec<mpsc::UnboundedSender<BrokerError>>>,
}

impl CloseListeners {
    pub(crate) fn subscribe(&self, already_closed: bool) -> CloseNotifier {
        let (tx, rx) = mpsc::unbounded_channel();
        if !already_closed {
            self.lock().push(tx);
        }
        rx
    }

    /// Deliver `reason` to every subscriber and end their streams.
    pub(crate) fn fail(&self, reason: &str) {
        for tx in self.lock().drain(..) {
            let _ = tx.send(BrokerError::Transport(reason.to_string()));
        }
    }

    /// End every subscriber's stream without an error.
    pub(crate) fn finish(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<BrokerError>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
