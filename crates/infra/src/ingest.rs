//! Ingress: validate, key, enrich and enqueue incoming orders.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument};

use ingestflow_core::{IdempotencyKey, MessageId, Order, RequestId, idempotency_key_for};
use ingestflow_events::ProcessingNotification;

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::fault::FaultKind;
use crate::queue::{
    ATTR_ERROR_TYPE_CANDIDATE, ATTR_IDEMPOTENCY_KEY, ATTR_SUBMITTED_AT, OutgoingMessage, QueueError,
};
use crate::resilience::{GuardedError, QUEUE};

/// Accepted-for-processing acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub message: String,
    pub message_id: MessageId,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone)]
pub struct IngestService {
    ctx: PipelineContext,
}

impl IngestService {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, payload), fields(request_id = %request_id), err)]
    pub async fn ingest(&self, payload: JsonValue, request_id: RequestId) -> Result<IngestReceipt, PipelineError> {
        let order = Order::from_payload(&payload)?;

        let fault = self.ctx.faults.decide_for_seed(&request_id.to_string());
        if fault == Some(FaultKind::SchemaValidationError) {
            error!(failure_mode = %self.ctx.faults.mode(), "simulated validation failure");
            return Err(PipelineError::SchemaValidation);
        }

        let key = resolve_key(&payload)?;
        let now = self.ctx.clock.now();

        let mut body = match payload {
            JsonValue::Object(map) => map,
            _ => return Err(PipelineError::Validation("payload must be a JSON object".to_string())),
        };
        body.insert("idempotencyKey".to_string(), JsonValue::String(key.to_string()));
        body.insert("ingestedAt".to_string(), JsonValue::String(now.to_rfc3339()));
        body.insert("requestId".to_string(), JsonValue::String(request_id.to_string()));

        let outgoing = OutgoingMessage::new(JsonValue::Object(body).to_string())
            .with_attribute(ATTR_IDEMPOTENCY_KEY, key.as_str())
            .with_attribute(ATTR_SUBMITTED_AT, now.to_rfc3339())
            .with_attribute(
                ATTR_ERROR_TYPE_CANDIDATE,
                fault.map(|f| f.as_str()).unwrap_or("none"),
            );

        let queue = self.ctx.queue.clone();
        let message_id = self
            .ctx
            .breakers
            .get(QUEUE)
            .call(|| queue.send(outgoing), QueueError::is_unavailable)
            .await
            .map_err(|e| match e {
                GuardedError::Open(open) => PipelineError::from(open),
                GuardedError::Inner(inner) => PipelineError::from(inner),
            })?;

        info!(message_id = %message_id, idempotency_key = %key, "message enqueued");

        self.ctx.publish(ProcessingNotification::received(
            &key, message_id, &order, request_id, now,
        ));

        Ok(IngestReceipt {
            message: "Event accepted for processing".to_string(),
            message_id,
            idempotency_key: key,
        })
    }
}

/// Caller-supplied key, or the SHA-256 of the canonical payload.
fn resolve_key(payload: &JsonValue) -> Result<IdempotencyKey, PipelineError> {
    match payload.get("idempotencyKey") {
        None | Some(JsonValue::Null) => {
            IdempotencyKey::new(idempotency_key_for(payload)).map_err(PipelineError::from)
        }
        Some(JsonValue::String(key)) => IdempotencyKey::new(key.as_str()).map_err(|_| {
            PipelineError::Validation("idempotencyKey must be a non-empty string".to_string())
        }),
        Some(_) => Err(PipelineError::Validation(
            "idempotencyKey must be a non-empty string".to_string(),
        )),
    }
}
