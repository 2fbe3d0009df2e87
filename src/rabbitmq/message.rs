use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::errors::{BrokerError, Result};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// An outbound message. Published persistent and mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub message_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Publishing {
    pub fn new(
        message_id: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Serialize `payload` as JSON under a fresh random message id.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(Uuid::new_v4().to_string(), CONTENT_TYPE_JSON, body))
    }

    pub fn text(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(message_id, CONTENT_TYPE_TEXT, body.into().into_bytes())
    }
}

/// How a successful publish was concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker acknowledged the message.
    Confirmed,
    /// No confirm arrived within the confirm timeout. The message was
    /// handed to the broker but durability was not observed.
    Unconfirmed,
}

/// Broker side of an acknowledgment, bound to the channel that produced
/// the delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;
}

/// Single-use acknowledgment capability for one delivery.
///
/// The first of `ack`, `reject` or `nack` consumes the handle; any later
/// call fails with [`BrokerError::AlreadyAcknowledged`] without reaching
/// the broker.
pub struct AckHandle {
    delivery_tag: u64,
    used: AtomicBool,
    acker: Arc<dyn Acknowledger>,
}

impl AckHandle {
    pub fn new(delivery_tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            used: AtomicBool::new(false),
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<()> {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BrokerError::AlreadyAcknowledged {
                delivery_tag: self.delivery_tag,
            })
    }

    pub async fn ack(&self, multiple: bool) -> Result<()> {
        self.claim()?;
        self.acker.ack(self.delivery_tag, multiple).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.claim()?;
        self.acker.reject(self.delivery_tag, requeue).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.claim()?;
        self.acker.nack(self.delivery_tag, multiple, requeue).await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.delivery_tag)
            .field("used", &self.is_used())
            .finish()
    }
}

/// An inbound message together with its acknowledgment capability.
#[derive(Debug)]
pub struct Delivery {
    pub message_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub consumer_tag: String,
    pub redelivered: bool,
    acker: AckHandle,
}

impl Delivery {
    pub fn new(
        message_id: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
        consumer_tag: impl Into<String>,
        redelivered: bool,
        acker: AckHandle,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            content_type: content_type.into(),
            body,
            consumer_tag: consumer_tag.into(),
            redelivered,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.acker.delivery_tag()
    }

    pub fn is_json(&self) -> bool {
        self.content_type == CONTENT_TYPE_JSON
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(false).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.acker.nack(multiple, requeue).await
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_used()
    }
}
