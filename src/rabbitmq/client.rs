// src/rabbitmq/client.rs
// The surface upstream services use: connect, publish, consume, disconnect.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use super::connection::{ConnectionState, ConnectionSupervisor};
use super::consumer::{ConsumerPool, DeliveryHandler};
use super::errors::Result;
use super::lapin_transport::LapinConnector;
use super::message::{PublishOutcome, Publishing};
use super::publisher::Publisher;
use super::transport::Connector;
use crate::config::BrokerConfig;

pub struct BrokerClient {
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Publisher,
    consumers: ConsumerPool,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(Arc::new(config), connector));
        Self {
            publisher: Publisher::new(supervisor.clone()),
            consumers: ConsumerPool::new(supervisor.clone()),
            supervisor,
        }
    }

    pub fn with_lapin(config: BrokerConfig) -> Self {
        Self::new(config, Arc::new(LapinConnector))
    }

    /// Start connecting in the background. Returns without waiting for
    /// the first connection.
    pub fn connect(&self) -> Result<()> {
        self.supervisor.connect()
    }

    /// Close the publisher channel and stop the supervisor. The supervisor
    /// is stopped even when the channel fails to close; that error is
    /// returned afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        let closed = self.publisher.close().await;
        if let Err(err) = &closed {
            warn!(error = %err, "Error closing publisher channel");
        }
        self.supervisor.disconnect().await?;
        info!("Broker client disconnected");
        closed
    }

    /// Publish with the configured publish timeout as deadline.
    pub async fn publish(
        &self,
        message_id: &str,
        content_type: &str,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
    ) -> Result<PublishOutcome> {
        let publishing = Publishing::new(message_id, content_type, body);
        let deadline = Instant::now() + self.supervisor.config().publish_timeout();
        self.publisher
            .publish(&publishing, exchange, routing_key, deadline)
            .await
    }

    pub async fn publish_with_deadline(
        &self,
        publishing: &Publishing,
        exchange: &str,
        routing_key: &str,
        deadline: Instant,
    ) -> Result<PublishOutcome> {
        self.publisher
            .publish(publishing, exchange, routing_key, deadline)
            .await
    }

    /// Consume `queue` until the client disconnects or the delivery
    /// streams drop. See [`ConsumerPool::consume`].
    pub async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let shutdown = self.supervisor.shutdown_signal().clone();
        self.consumers.consume(queue, handler, shutdown).await
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}
