//! Processing notifications emitted on ledger transitions and at ingest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingestflow_core::{IdempotencyKey, MessageId, Order, RequestId};

use crate::envelope::EventEnvelope;

/// `source` stamped on every envelope emitted by the pipeline.
pub const EVENT_SOURCE: &str = "ingestion.pipeline";

pub const DETAIL_RECEIVED: &str = "Ingestion Received";
pub const DETAIL_SUCCESS: &str = "Ingestion Success";
pub const DETAIL_FAILURE: &str = "Ingestion Failure";

pub type NotificationEnvelope = EventEnvelope<ProcessingNotification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Ingested,
    Succeeded,
    Failed,
}

/// Notification detail.
///
/// `event_id` is derived from the key and outcome (`success-<key>`,
/// `failure-<key>`), so a redelivered duplicate re-emits the same id and
/// consumers can dedupe on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingNotification {
    pub event_id: String,
    pub idempotency_key: IdempotencyKey,
    pub status: NotificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProcessingNotification {
    fn base(
        event_id: String,
        key: &IdempotencyKey,
        status: NotificationStatus,
        order: Option<&Order>,
        request_id: RequestId,
    ) -> Self {
        Self {
            event_id,
            idempotency_key: key.clone(),
            status,
            order_id: order.map(|o| o.order_id.clone()),
            amount: order.map(|o| o.amount),
            request_id,
            message_id: None,
            ingested_at: None,
            processed_at: None,
            failed_at: None,
            duration_ms: None,
            error_type: None,
            error_message: None,
        }
    }

    /// A message was accepted by ingest and placed on the primary queue.
    pub fn received(
        key: &IdempotencyKey,
        message_id: MessageId,
        order: &Order,
        request_id: RequestId,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Some(message_id),
            ingested_at: Some(ingested_at),
            ..Self::base(
                message_id.to_string(),
                key,
                NotificationStatus::Ingested,
                Some(order),
                request_id,
            )
        }
    }

    pub fn succeeded(
        key: &IdempotencyKey,
        order: Option<&Order>,
        request_id: RequestId,
        processed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            processed_at: Some(processed_at),
            duration_ms: Some(duration_ms),
            ..Self::base(
                format!("success-{key}"),
                key,
                NotificationStatus::Succeeded,
                order,
                request_id,
            )
        }
    }

    pub fn failed(
        key: &IdempotencyKey,
        order: Option<&Order>,
        request_id: RequestId,
        failed_at: DateTime<Utc>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            failed_at: Some(failed_at),
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
            ..Self::base(
                format!("failure-{key}"),
                key,
                NotificationStatus::Failed,
                order,
                request_id,
            )
        }
    }

    pub fn detail_type(&self) -> &'static str {
        match self.status {
            NotificationStatus::Ingested => DETAIL_RECEIVED,
            NotificationStatus::Succeeded => DETAIL_SUCCESS,
            NotificationStatus::Failed => DETAIL_FAILURE,
        }
    }

    /// Wrap in an envelope stamped with `time`.
    pub fn into_envelope(self, time: DateTime<Utc>) -> NotificationEnvelope {
        EventEnvelope::new(EVENT_SOURCE, self.detail_type(), time, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order {
            order_id: "o1".to_string(),
            amount: 50.0,
        }
    }

    #[test]
    fn success_notification_has_stable_event_id_and_duration() {
        let key = IdempotencyKey::new("k1").unwrap();
        let n = ProcessingNotification::succeeded(&key, Some(&order()), RequestId::new(), Utc::now(), 12);

        assert_eq!(n.event_id, "success-k1");
        assert_eq!(n.duration_ms, Some(12));
        assert_eq!(n.detail_type(), DETAIL_SUCCESS);

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(json["orderId"], "o1");
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn failure_envelope_routes_on_failure_detail_type() {
        let key = IdempotencyKey::new("k2").unwrap();
        let env = ProcessingNotification::failed(
            &key,
            Some(&order()),
            RequestId::new(),
            Utc::now(),
            "ProcessingError",
            "Amount exceeds maximum limit",
        )
        .into_envelope(Utc::now());

        assert_eq!(env.source(), EVENT_SOURCE);
        assert_eq!(env.detail_type(), DETAIL_FAILURE);
        assert_eq!(env.detail().event_id, "failure-k2");
        assert_eq!(
            env.detail().error_message.as_deref(),
            Some("Amount exceeds maximum limit")
        );
    }
}
