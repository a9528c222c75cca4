//! Message queue contract.
//!
//! Semantics follow a visibility-timeout queue:
//!
//! - `receive` hides each returned message for the requested visibility
//!   timeout and bumps its receive count. Each received copy carries a fresh
//!   [`ReceiptHandle`]; only the latest handle may delete or re-time it.
//! - A message that is not deleted becomes visible again when its timeout
//!   lapses (this is the NACK path).
//! - With a dead-letter target configured, a message whose receive count
//!   has reached the maximum is moved there on its next receive instead of
//!   being delivered.

pub mod in_memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use ingestflow_core::MessageId;

pub use in_memory::InMemoryQueue;

/// Attribute carrying the idempotency key.
pub const ATTR_IDEMPOTENCY_KEY: &str = "idempotencyKey";
/// Attribute carrying the ingest time (RFC 3339).
pub const ATTR_SUBMITTED_AT: &str = "submittedAt";
/// Attribute carrying the fault kind decided at ingest, or `none`.
pub const ATTR_ERROR_TYPE_CANDIDATE: &str = "errorTypeCandidate";

/// Upper bound on messages returned by a single `receive`.
pub const MAX_RECEIVE_BATCH: usize = 10;
/// Upper bound on a send delay.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Opaque token identifying one received copy of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    /// Initial invisibility. Clamped to [`MAX_DELAY`].
    pub delay: Duration,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: BTreeMap::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay.min(MAX_DELAY);
        self
    }
}

/// A received copy of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    pub receive_count: u32,
    pub sent_timestamp: DateTime<Utc>,
    pub first_receive_timestamp: Option<DateTime<Utc>>,
    pub receipt_handle: ReceiptHandle,
}

impl QueueMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Approximate message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    /// Visible now.
    pub available: usize,
    /// Received and not yet deleted or released.
    pub in_flight: usize,
    /// Sent with a delay that has not yet elapsed.
    pub delayed: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.available + self.in_flight
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {queue} unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    /// The handle is unknown or was superseded by a later receive.
    #[error("receipt handle {0} is not valid")]
    InvalidReceipt(ReceiptHandle),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable { .. })
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync + std::fmt::Debug {
    /// Queue name used in logs.
    fn name(&self) -> &str;

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError>;

    /// Receive up to `max_messages` (clamped to [`MAX_RECEIVE_BATCH`])
    /// visible messages, hiding each for `visibility_timeout`.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Reset the remaining invisibility of a received copy. Zero releases it.
    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
