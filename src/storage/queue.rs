use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A message on a queue: broker-level properties around an opaque body.
///
/// The body is the payload other components agree on (a task tuple, a result
/// path). Properties mirror what an AMQP broker carries next to the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub published_at: DateTime<Utc>,
    pub body: String,
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            reply_to: None,
            published_at: Utc::now(),
            body: body.into(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a raw queue entry. Anything that is not an envelope is taken to
    /// be a bare body from a producer that sets no properties.
    pub fn from_wire(raw: &str) -> Self {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(_) => Self {
                message_id: String::new(),
                correlation_id: None,
                reply_to: None,
                published_at: Utc::now(),
                body: raw.to_string(),
            },
        }
    }
}

/// Whether a receive needs a later `ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The message stays owned by this consumer until acknowledged and is
    /// redelivered by `recover` if it never is
    Manual,
    /// The message is gone from the broker once received
    Auto,
}

/// A received message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub envelope: Envelope,
    pub ack_mode: AckMode,
    /// Exact bytes as stored by the broker, used to acknowledge
    pub raw: String,
}

impl Delivery {
    pub fn body(&self) -> &str {
        &self.envelope.body
    }
}

/// At-least-once, FIFO-per-queue message transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to `queue`
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()>;

    /// Take the oldest message from `queue`, waiting up to `wait` for one
    async fn receive(&self, queue: &str, ack_mode: AckMode, wait: Duration) -> Result<Option<Delivery>>;

    /// Settle a manually acknowledged delivery. Acknowledging an auto-ack
    /// delivery does nothing.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Put back every message this consumer received from `queue` but never
    /// acknowledged. Returns how many were requeued.
    async fn recover(&self, queue: &str) -> Result<usize>;
}
