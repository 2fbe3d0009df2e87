// src/rabbitmq/publisher.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use super::channel::ChannelWrapper;
use super::connection::ConnectionSupervisor;
use super::errors::{BrokerError, Result};
use super::message::{PublishOutcome, Publishing};
use super::transport::ConfirmOutcome;

/// Publishes with confirms, riding out disconnects until the caller's
/// deadline.
///
/// One confirm-mode channel is shared by all callers and replaced whenever
/// an operation on it fails.
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    channel: Mutex<Option<ChannelWrapper>>,
    confirm_timeout: Duration,
    strict_confirms: bool,
    retry_interval: Duration,
}

/// Failures after which the message can be sent again from the top.
fn should_retry(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::NotConnected
            | BrokerError::Disconnected
            | BrokerError::ChannelClosed
            | BrokerError::Nacked
    )
}

impl Publisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        let config = supervisor.config();
        let confirm_timeout = config.confirm_timeout();
        let strict_confirms = config.strict_confirms;
        let retry_interval = config.reconnect_interval();

        Self {
            supervisor,
            channel: Mutex::new(None),
            confirm_timeout,
            strict_confirms,
            retry_interval,
        }
    }

    /// Publish `publishing` persistent and mandatory.
    ///
    /// Waits for the connection while disconnected, and starts over when
    /// the channel or connection fails underneath the publish or the
    /// broker nacks. Fails with [`BrokerError::NotConnected`] if the
    /// deadline passes first, and with [`BrokerError::Unroutable`] when
    /// the broker returns the message.
    pub async fn publish(
        &self,
        publishing: &Publishing,
        exchange: &str,
        routing_key: &str,
        deadline: Instant,
    ) -> Result<PublishOutcome> {
        loop {
            if self
                .supervisor
                .gate()
                .wait(true, sleep_until(deadline))
                .await
                .is_err()
            {
                warn!(
                    message_id = %publishing.message_id,
                    exchange,
                    routing_key,
                    "Not connected to RabbitMQ before the publish deadline"
                );
                return Err(BrokerError::NotConnected);
            }

            let err = match self
                .publish_once(publishing, exchange, routing_key, deadline)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) if should_retry(&err) => err,
                Err(err) => return Err(err),
            };

            debug!(
                message_id = %publishing.message_id,
                error = %err,
                "Publish attempt failed, retrying"
            );

            let now = Instant::now();
            if now >= deadline {
                return Err(match err {
                    BrokerError::Nacked => BrokerError::Nacked,
                    _ => BrokerError::NotConnected,
                });
            }
            sleep_until(deadline.min(now + self.retry_interval)).await;
        }
    }

    async fn publish_once(
        &self,
        publishing: &Publishing,
        exchange: &str,
        routing_key: &str,
        deadline: Instant,
    ) -> Result<PublishOutcome> {
        let channel = timeout_at(deadline, self.channel())
            .await
            .map_err(|_| BrokerError::NotConnected)??;

        let confirm = match channel.publish(exchange, routing_key, publishing).await {
            Ok(confirm) => confirm,
            Err(err) => {
                self.discard(&channel).await;
                return Err(err);
            }
        };

        let confirm_deadline = deadline.min(Instant::now() + self.confirm_timeout);
        match timeout_at(confirm_deadline, confirm).await {
            Ok(Ok(ConfirmOutcome::Ack)) => {
                debug!(
                    message_id = %publishing.message_id,
                    "Published message to exchange '{}' with routing key '{}'",
                    exchange,
                    routing_key
                );
                Ok(PublishOutcome::Confirmed)
            }
            Ok(Ok(ConfirmOutcome::Returned)) => {
                warn!(
                    message_id = %publishing.message_id,
                    exchange,
                    routing_key,
                    "Message returned as unroutable"
                );
                Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Ok(Ok(ConfirmOutcome::Nack)) => {
                warn!(message_id = %publishing.message_id, "Broker nacked message");
                Err(BrokerError::Nacked)
            }
            Ok(Ok(ConfirmOutcome::NotRequested)) => {
                warn!(
                    message_id = %publishing.message_id,
                    "Channel is not in confirm mode, delivery not confirmed"
                );
                Ok(PublishOutcome::Unconfirmed)
            }
            Ok(Err(err)) => {
                self.discard(&channel).await;
                Err(err)
            }
            Err(_) => {
                warn!(
                    message_id = %publishing.message_id,
                    exchange,
                    routing_key,
                    timeout_ms = self.confirm_timeout.as_millis() as u64,
                    "Publisher confirm not received in time"
                );
                if self.strict_confirms {
                    Err(BrokerError::ConfirmTimeout)
                } else {
                    Ok(PublishOutcome::Unconfirmed)
                }
            }
        }
    }

    /// The shared confirm-mode channel, opened on first use.
    async fn channel(&self) -> Result<ChannelWrapper> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let channel = self.supervisor.channel().await?;
        channel.confirm_select().await?;
        debug!(channel_id = channel.id(), "Opened publisher channel");
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Drop `channel` if it is still the shared one so the next attempt
    /// opens a fresh channel.
    async fn discard(&self, channel: &ChannelWrapper) {
        let mut slot = self.channel.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(channel)) {
            *slot = None;
        }
        drop(slot);

        if let Err(err) = channel.close().await {
            debug!(error = %err, "Error closing failed publisher channel");
        }
    }

    pub async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
