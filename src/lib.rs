//! Resilient RabbitMQ client.
//!
//! A [`ConnectionSupervisor`](rabbitmq::ConnectionSupervisor) keeps one
//! physical connection alive and re-declares the configured topology after
//! every reconnect. Publishers and consumers wait on its
//! [`Gate`](rabbitmq::Gate) instead of failing while the broker is away.

pub mod config;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use rabbitmq::{BrokerClient, BrokerError, Delivery, DeliveryHandler, Publishing};
