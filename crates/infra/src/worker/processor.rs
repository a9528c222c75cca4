//! Per-message processing.
//!
//! Every message ends in exactly one [`Disposition`]: `Ack` (delete from the
//! queue) or `Nack` (leave it; the transport redelivers after the
//! visibility timeout and dead-letters it after the maximum receive count).

use std::time::Instant;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use ingestflow_core::{IdempotencyKey, MessageId, Order, RequestId};
use ingestflow_events::ProcessingNotification;

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::fault::FaultKind;
use crate::ledger::{ClaimOutcome, ClaimRequest, IdempotencyRecord, LedgerError};
use crate::queue::QueueMessage;
use crate::resilience::{GuardedError, LEDGER_STORE};

use super::business::BusinessError;

/// Why a message was left on the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum NackReason {
    /// Body is not JSON or carries no idempotency key.
    Malformed(String),
    /// Injected fault or infrastructure failure; redelivery may succeed.
    Failed(PipelineError),
    /// Another attempt currently holds the claim.
    DuplicateInflight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Nack(NackReason),
}

impl Disposition {
    pub fn is_ack(&self) -> bool {
        matches!(self, Disposition::Ack)
    }
}

/// One entry of a partial batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: MessageId,
}

/// Lists only the messages that must be redelivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn failed_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.batch_item_failures.iter().map(|f| f.item_identifier)
    }
}

/// Runs the claim → process → record protocol for queue messages.
#[derive(Debug, Clone)]
pub struct MessageProcessor {
    ctx: PipelineContext,
    cancel: CancellationToken,
}

impl MessageProcessor {
    pub fn new(ctx: PipelineContext) -> Self {
        Self::with_cancellation(ctx, CancellationToken::new())
    }

    /// `cancel` preempts in-progress slow-downstream waits (worker shutdown).
    pub fn with_cancellation(ctx: PipelineContext, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Process each message independently; the response lists the NACKed
    /// ids only.
    #[instrument(skip(self, messages), fields(request_id = %request_id, records = messages.len()))]
    pub async fn process_batch(&self, messages: &[QueueMessage], request_id: RequestId) -> BatchResponse {
        let mut response = BatchResponse::default();

        for message in messages {
            if let Disposition::Nack(reason) = self.process_message(message, request_id).await {
                debug!(message_id = %message.id, reason = ?reason, "message not acknowledged");
                response.batch_item_failures.push(BatchItemFailure {
                    item_identifier: message.id,
                });
            }
        }

        info!(
            total = messages.len(),
            failed = response.batch_item_failures.len(),
            "batch processed"
        );
        response
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, receive_count = message.receive_count))]
    pub async fn process_message(&self, message: &QueueMessage, request_id: RequestId) -> Disposition {
        let (body, key) = match parse_body(&message.body) {
            Ok(parsed) => parsed,
            Err(reason) => {
                error!(reason = %reason, "malformed message");
                return Disposition::Nack(NackReason::Malformed(reason));
            }
        };

        info!(idempotency_key = %key, "processing message");

        match self.ctx.faults.decide(&message.id) {
            Some(FaultKind::TimeoutError) => {
                warn!(idempotency_key = %key, "simulating slow downstream");
                let err = self.simulate_slow_downstream().await;
                return Disposition::Nack(NackReason::Failed(err));
            }
            Some(FaultKind::TransientError) => {
                error!(idempotency_key = %key, error_type = "TransientError", "simulated transient error");
                return Disposition::Nack(NackReason::Failed(PipelineError::Transient(
                    "Simulated transient error".to_string(),
                )));
            }
            Some(FaultKind::SchemaValidationError) | None => {}
        }

        let started = Instant::now();
        let claim = ClaimRequest::new(key.clone(), &body, request_id, message.id);

        let outcome = match self.ledger_call(|| self.ctx.ledger.claim(claim)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(idempotency_key = %key, error = %err, "claim failed");
                return Disposition::Nack(NackReason::Failed(err));
            }
        };

        info!(idempotency_key = %key, outcome = outcome.label(), "claim resolved");

        match outcome {
            ClaimOutcome::DuplicateSucceeded(record) => {
                self.emit_duplicate_success(&key, &body, &record, request_id, started);
                Disposition::Ack
            }
            ClaimOutcome::DuplicateInflight => Disposition::Nack(NackReason::DuplicateInflight),
            ClaimOutcome::New | ClaimOutcome::Retry { .. } => {
                self.run_claimed(&key, &body, request_id, started).await
            }
        }
    }

    async fn run_claimed(
        &self,
        key: &IdempotencyKey,
        body: &JsonValue,
        request_id: RequestId,
        started: Instant,
    ) -> Disposition {
        let order = match Order::from_payload(body) {
            Ok(order) => order,
            Err(e) => {
                let message = format!("Processing error: {}", e.message());
                self.record_failure(key, &message).await;
                error!(idempotency_key = %key, error = %message, "claimed message carries an invalid order");
                return Disposition::Nack(NackReason::Failed(PipelineError::Processing(message)));
            }
        };

        match self.ctx.processor.process(&order).await {
            Ok(result) => {
                let result = match serde_json::to_value(&result) {
                    Ok(v) => v,
                    Err(e) => {
                        let message = format!("Processing error: {e}");
                        self.record_failure(key, &message).await;
                        return Disposition::Nack(NackReason::Failed(PipelineError::Processing(message)));
                    }
                };

                if let Err(err) = self.ledger_call(|| self.ctx.ledger.complete(key, result)).await {
                    error!(idempotency_key = %key, error = %err, "failed to record success");
                    return Disposition::Nack(NackReason::Failed(err));
                }

                let duration_ms = started.elapsed().as_millis() as u64;
                info!(idempotency_key = %key, duration_ms, "message processed");
                self.ctx.publish(ProcessingNotification::succeeded(
                    key,
                    Some(&order),
                    request_id,
                    self.ctx.clock.now(),
                    duration_ms,
                ));
                Disposition::Ack
            }
            Err(BusinessError::Rejected(message)) => {
                error!(idempotency_key = %key, error = %message, error_type = "ProcessingError", "message processing failed");
                self.record_failure(key, &message).await;
                self.ctx.publish(ProcessingNotification::failed(
                    key,
                    Some(&order),
                    request_id,
                    self.ctx.clock.now(),
                    "ProcessingError",
                    message.clone(),
                ));
                Disposition::Nack(NackReason::Failed(PipelineError::Processing(message)))
            }
            Err(e @ BusinessError::Unexpected(_)) => {
                let message = e.to_string();
                error!(idempotency_key = %key, error = %message, "unexpected error processing message");
                self.record_failure(key, &message).await;
                Disposition::Nack(NackReason::Failed(PipelineError::Processing(message)))
            }
        }
    }

    async fn record_failure(&self, key: &IdempotencyKey, message: &str) {
        if let Err(err) = self.ledger_call(|| self.ctx.ledger.fail(key, message)).await {
            error!(idempotency_key = %key, error = %err, "failed to record failure");
        }
    }

    fn emit_duplicate_success(
        &self,
        key: &IdempotencyKey,
        body: &JsonValue,
        record: &IdempotencyRecord,
        request_id: RequestId,
        started: Instant,
    ) {
        info!(idempotency_key = %key, "already succeeded; re-emitting success");
        let order = Order::from_payload(body).ok();
        self.ctx.publish(ProcessingNotification::succeeded(
            key,
            order.as_ref(),
            request_id,
            record.processed_at.unwrap_or_else(|| self.ctx.clock.now()),
            started.elapsed().as_millis() as u64,
        ));
    }

    /// A downstream call that would outlive the processing deadline. It is
    /// raced against the deadline and the shutdown token and always fails.
    async fn simulate_slow_downstream(&self) -> PipelineError {
        let deadline = self.ctx.config.processing_deadline;
        let downstream = tokio::time::sleep(self.ctx.config.slow_downstream);

        tokio::select! {
            _ = self.cancel.cancelled() => {
                PipelineError::Timeout("Slow downstream call preempted by shutdown".to_string())
            }
            outcome = tokio::time::timeout(deadline, downstream) => match outcome {
                Err(_) => PipelineError::Timeout(format!(
                    "Simulated timeout: downstream exceeded {}s deadline",
                    deadline.as_secs()
                )),
                Ok(()) => PipelineError::Timeout("Simulated timeout: downstream responded too late".to_string()),
            }
        }
    }

    /// Run a ledger operation under the `ledger-store` breaker. Only
    /// storage unavailability counts against the breaker.
    async fn ledger_call<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, PipelineError>
    where
        Fut: std::future::Future<Output = Result<T, LedgerError>>,
    {
        self.ctx
            .breakers
            .get(LEDGER_STORE)
            .call(op, LedgerError::is_unavailable)
            .await
            .map_err(|e| match e {
                GuardedError::Open(open) => PipelineError::from(open),
                GuardedError::Inner(inner) => PipelineError::from(inner),
            })
    }
}

fn parse_body(body: &str) -> Result<(JsonValue, IdempotencyKey), String> {
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| format!("body is not valid JSON: {e}"))?;
    let key = value
        .get("idempotencyKey")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "Missing idempotency key".to_string())
        .and_then(|k| IdempotencyKey::new(k).map_err(|_| "Missing idempotency key".to_string()))?;
    Ok((value, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use ingestflow_core::ManualClock;
    use ingestflow_events::{DETAIL_FAILURE, DETAIL_SUCCESS, EventBus, NotificationStatus};
    use serde_json::json;

    use crate::config::PipelineConfig;
    use crate::context::InMemoryPipeline;
    use crate::fault::FailureMode;
    use crate::ledger::{IdempotencyLedger, RecordStatus};
    use crate::queue::{MessageQueue, OutgoingMessage};
    use crate::resilience::BreakerState;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn pipeline() -> InMemoryPipeline {
        InMemoryPipeline::with_clock(PipelineConfig::default(), Arc::new(ManualClock::starting_now()))
    }

    async fn enqueue_and_receive(p: &InMemoryPipeline, body: JsonValue) -> QueueMessage {
        p.queue.send(OutgoingMessage::new(body.to_string())).await.unwrap();
        p.queue.receive(1, VISIBILITY).await.unwrap().remove(0)
    }

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn valid_order_succeeds_and_emits_success() {
        let p = pipeline();
        let sub = p.bus.subscribe();
        let processor = MessageProcessor::new(p.context.clone());

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k1", "orderId": "o1", "amount": 50})).await;
        assert_eq!(processor.process_message(&msg, RequestId::new()).await, Disposition::Ack);

        let record = p.ledger.get(&key("k1")).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Succeeded);
        assert_eq!(record.result.unwrap()["total"], json!(55.0));

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail_type(), DETAIL_SUCCESS);
        assert_eq!(events[0].detail().event_id, "success-k1");
    }

    #[tokio::test]
    async fn redelivered_success_is_acked_without_reprocessing() {
        let p = pipeline();
        let processor = MessageProcessor::new(p.context.clone());
        let body = json!({"idempotencyKey": "k1", "orderId": "o1", "amount": 50});

        let first = enqueue_and_receive(&p, body.clone()).await;
        processor.process_message(&first, RequestId::new()).await;
        let stored = p.ledger.get(&key("k1")).await.unwrap().unwrap();

        let sub = p.bus.subscribe();
        let second = enqueue_and_receive(&p, body).await;
        assert_eq!(processor.process_message(&second, RequestId::new()).await, Disposition::Ack);

        let after = p.ledger.get(&key("k1")).await.unwrap().unwrap();
        assert_eq!(after.result, stored.result);
        assert_eq!(after.attempts, 1);
        assert_eq!(sub.drain()[0].detail().status, NotificationStatus::Succeeded);
    }

    #[tokio::test]
    async fn business_rejection_fails_record_and_nacks() {
        let p = pipeline();
        let sub = p.bus.subscribe();
        let processor = MessageProcessor::new(p.context.clone());

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "big", "orderId": "o2", "amount": 20000})).await;
        let disposition = processor.process_message(&msg, RequestId::new()).await;

        assert!(matches!(
            disposition,
            Disposition::Nack(NackReason::Failed(PipelineError::Processing(ref m))) if m == "Amount exceeds maximum limit"
        ));
        let record = p.ledger.get(&key("big")).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);

        let events = sub.drain();
        assert_eq!(events[0].detail_type(), DETAIL_FAILURE);
        assert_eq!(events[0].detail().error_type.as_deref(), Some("ProcessingError"));

        // The failed record is retried on redelivery.
        let again = enqueue_and_receive(&p, json!({"idempotencyKey": "big", "orderId": "o2", "amount": 20000})).await;
        processor.process_message(&again, RequestId::new()).await;
        assert_eq!(p.ledger.get(&key("big")).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn missing_key_is_malformed() {
        let p = pipeline();
        let processor = MessageProcessor::new(p.context.clone());

        let msg = enqueue_and_receive(&p, json!({"orderId": "o1", "amount": 5})).await;
        assert!(matches!(
            processor.process_message(&msg, RequestId::new()).await,
            Disposition::Nack(NackReason::Malformed(_))
        ));
        assert!(p.ledger.is_empty());
    }

    #[tokio::test]
    async fn inflight_duplicate_is_nacked() {
        let p = pipeline();
        let processor = MessageProcessor::new(p.context.clone());
        let body = json!({"idempotencyKey": "k1", "orderId": "o1", "amount": 5});

        p.ledger
            .claim(ClaimRequest::new(key("k1"), &body, RequestId::new(), MessageId::new()))
            .await
            .unwrap();

        let msg = enqueue_and_receive(&p, body).await;
        assert_eq!(
            processor.process_message(&msg, RequestId::new()).await,
            Disposition::Nack(NackReason::DuplicateInflight)
        );
    }

    #[tokio::test]
    async fn transient_fault_leaves_ledger_untouched() {
        let p = pipeline();
        p.context.faults.set_mode(FailureMode::RandomFailP30);
        let processor = MessageProcessor::new(p.context.clone());

        // Send until one message lands in the failing bucket.
        loop {
            let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k", "orderId": "o", "amount": 1})).await;
            if crate::fault::decide(&FailureMode::RandomFailP30, &msg.id).is_some() {
                assert!(matches!(
                    processor.process_message(&msg, RequestId::new()).await,
                    Disposition::Nack(NackReason::Failed(PipelineError::Transient(_)))
                ));
                assert!(p.ledger.is_empty());
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_downstream_is_cut_off_at_deadline() {
        let p = pipeline();
        p.context.faults.set_mode(FailureMode::SlowDownstream);
        let processor = MessageProcessor::new(p.context.clone());

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k", "orderId": "o", "amount": 1})).await;
        let disposition = processor.process_message(&msg, RequestId::new()).await;

        assert!(matches!(
            disposition,
            Disposition::Nack(NackReason::Failed(PipelineError::Timeout(_)))
        ));
        assert!(p.ledger.is_empty());
    }

    #[tokio::test]
    async fn slow_downstream_is_preempted_by_cancellation() {
        let p = pipeline();
        p.context.faults.set_mode(FailureMode::SlowDownstream);
        let token = CancellationToken::new();
        let processor = MessageProcessor::with_cancellation(p.context.clone(), token.clone());
        token.cancel();

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k", "orderId": "o", "amount": 1})).await;
        let disposition = tokio::time::timeout(
            Duration::from_secs(1),
            processor.process_message(&msg, RequestId::new()),
        )
        .await
        .expect("cancellation should preempt the wait");

        assert!(!disposition.is_ack());
    }

    #[tokio::test]
    async fn ledger_outage_nacks_and_opens_breaker() {
        let p = pipeline();
        let processor = MessageProcessor::new(p.context.clone());
        p.ledger.set_available(false);

        for i in 0..4 {
            let msg = enqueue_and_receive(&p, json!({"idempotencyKey": format!("k{i}"), "orderId": "o", "amount": 1})).await;
            assert!(!processor.process_message(&msg, RequestId::new()).await.is_ack());
        }

        let breaker = p.context.breakers.get(LEDGER_STORE);
        assert_eq!(breaker.state(), BreakerState::Open);

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k9", "orderId": "o", "amount": 1})).await;
        assert!(matches!(
            processor.process_message(&msg, RequestId::new()).await,
            Disposition::Nack(NackReason::Failed(PipelineError::CircuitOpen { .. }))
        ));
    }

    #[tokio::test]
    async fn batch_response_lists_only_failures() {
        let p = pipeline();
        let processor = MessageProcessor::new(p.context.clone());

        for body in [
            json!({"idempotencyKey": "a", "orderId": "o1", "amount": 5}),
            json!({"idempotencyKey": "b", "orderId": "o2", "amount": 50000}),
            json!({"idempotencyKey": "c", "orderId": "o3", "amount": 7}),
        ] {
            p.queue.send(OutgoingMessage::new(body.to_string())).await.unwrap();
        }
        let batch = p.queue.receive(10, VISIBILITY).await.unwrap();

        let response = processor.process_batch(&batch, RequestId::new()).await;
        let failed: Vec<_> = response.failed_ids().collect();
        assert_eq!(failed, vec![batch[1].id]);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["batchItemFailures"][0]["itemIdentifier"], json!(batch[1].id.to_string()));
    }

    #[tokio::test]
    async fn publish_outage_does_not_roll_back_success() {
        let p = pipeline();
        p.bus.set_available(false);
        let processor = MessageProcessor::new(p.context.clone());

        let msg = enqueue_and_receive(&p, json!({"idempotencyKey": "k1", "orderId": "o1", "amount": 50})).await;
        assert!(processor.process_message(&msg, RequestId::new()).await.is_ack());
        assert_eq!(
            p.ledger.get(&key("k1")).await.unwrap().unwrap().status,
            RecordStatus::Succeeded
        );
    }
}
