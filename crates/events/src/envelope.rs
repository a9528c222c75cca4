use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for a published notification.
///
/// Mirrors the shape event routers expect: an envelope id, the emitting
/// `source`, a `detail_type` used for routing rules, the publish time and
/// the domain-specific `detail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<D> {
    id: Uuid,
    source: String,
    detail_type: String,
    time: DateTime<Utc>,
    detail: D,
}

impl<D> EventEnvelope<D> {
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        time: DateTime<Utc>,
        detail: D,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            detail_type: detail_type.into(),
            time,
            detail,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn detail_type(&self) -> &str {
        &self.detail_type
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn detail(&self) -> &D {
        &self.detail
    }

    pub fn into_detail(self) -> D {
        self.detail
    }
}
