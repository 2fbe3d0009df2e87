// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Not connected to RabbitMQ")]
    NotConnected,

    #[error("Message was returned as unroutable (exchange '{exchange}', routing key '{routing_key}')")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("Publisher confirm was not observed in time")]
    ConfirmTimeout,

    #[error("Broker negatively acknowledged the message")]
    Nacked,

    #[error("Disconnected from RabbitMQ, trying to reconnect")]
    Disconnected,

    #[error("Topology declaration failed: {0}")]
    TopologyDeclarationFailed(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Channel already closed")]
    AlreadyClosed,

    #[error("Delivery {delivery_tag} was already acknowledged")]
    AlreadyAcknowledged { delivery_tag: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("RabbitMQ transport error: {0}")]
    Transport(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Whether the caller may retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::NotConnected
                | BrokerError::Disconnected
                | BrokerError::ChannelClosed
                | BrokerError::ConfirmTimeout
        )
    }
}

// Channel and connection state errors mean the handle went away underneath us,
// which the publisher treats as a reason to wait for the gate again.
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidChannelState(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::IOError(_) => BrokerError::Disconnected,
            other => BrokerError::Transport(other.to_string()),
        }
    }
}
