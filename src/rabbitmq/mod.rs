// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: supervised connection, recovering channels,
// confirmed publishing and a consumer pool.

pub mod errors;
pub mod gate;
pub mod message;
pub mod transport;

pub mod lapin_transport;
pub mod memory;

pub mod channel;
pub mod connection;
pub mod topology;

pub mod client;
pub mod consumer;
pub mod publisher;

pub use channel::{ChannelSource, ChannelWrapper};
pub use client::BrokerClient;
pub use connection::{ConnectionState, ConnectionSupervisor};
pub use consumer::{ConsumerPool, DeliveryHandler};
pub use errors::{BrokerError, Result};
pub use gate::{Gate, Shutdown};
pub use message::{AckHandle, Delivery, PublishOutcome, Publishing};
pub use publisher::Publisher;
