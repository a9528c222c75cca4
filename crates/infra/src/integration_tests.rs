//! End-to-end pipeline scenarios on the in-memory wiring.
//!
//! ingest → queue → worker batch → ledger → notifications → DLQ → redrive

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ingestflow_core::{IdempotencyKey, ManualClock, RequestId};
use ingestflow_events::{DETAIL_RECEIVED, DETAIL_SUCCESS, EventBus};

use crate::config::PipelineConfig;
use crate::context::InMemoryPipeline;
use crate::fault::{self, FailureMode};
use crate::ingest::IngestService;
use crate::ledger::{ClaimOutcome, ClaimRequest, IdempotencyLedger, RecordStatus};
use crate::queue::MessageQueue;
use crate::redrive::{PreviewRequest, RedriveEngine, StartRequest};
use crate::worker::MessageProcessor;

const VISIBILITY: Duration = Duration::from_secs(30);

fn setup() -> (InMemoryPipeline, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let pipeline = InMemoryPipeline::with_clock(PipelineConfig::default(), clock.clone());
    (pipeline, clock)
}

/// One worker poll: receive, process, delete what was acknowledged.
async fn drain_once(p: &InMemoryPipeline) -> usize {
    let messages = p.queue.receive(10, VISIBILITY).await.unwrap();
    let processor = MessageProcessor::new(p.context.clone());
    let response = processor.process_batch(&messages, RequestId::new()).await;
    let failed: Vec<_> = response.failed_ids().collect();

    for message in &messages {
        if !failed.contains(&message.id) {
            p.queue.delete(&message.receipt_handle).await.unwrap();
        }
    }
    messages.len()
}

#[tokio::test]
async fn valid_order_flows_to_success() {
    let (p, _clock) = setup();
    let sub = p.bus.subscribe();
    let ingest = IngestService::new(p.context.clone());

    let receipt = ingest
        .ingest(json!({"orderId": "o1", "amount": 50}), RequestId::new())
        .await
        .unwrap();
    assert_eq!(receipt.message, "Event accepted for processing");

    assert_eq!(drain_once(&p).await, 1);
    assert!(p.queue.is_empty());

    let record = p.ledger.get(&receipt.idempotency_key).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.attempts, 1);
    let result = record.result.unwrap();
    assert_eq!(result["tax"], json!(5.0));
    assert_eq!(result["total"], json!(55.0));

    let events = sub.drain();
    let kinds: Vec<_> = events.iter().map(|e| e.detail_type().to_string()).collect();
    assert_eq!(kinds, vec![DETAIL_RECEIVED, DETAIL_SUCCESS]);
}

#[tokio::test]
async fn resubmitting_a_succeeded_key_does_not_reprocess() {
    let (p, _clock) = setup();
    let ingest = IngestService::new(p.context.clone());
    let payload = json!({"orderId": "o1", "amount": 50, "idempotencyKey": "order-o1"});

    ingest.ingest(payload.clone(), RequestId::new()).await.unwrap();
    drain_once(&p).await;
    let key = IdempotencyKey::new("order-o1").unwrap();
    let first = p.ledger.get(&key).await.unwrap().unwrap();

    let sub = p.bus.subscribe();
    ingest.ingest(payload, RequestId::new()).await.unwrap();
    drain_once(&p).await;

    let second = p.ledger.get(&key).await.unwrap().unwrap();
    assert_eq!(second.attempts, 1);
    assert_eq!(second.result, first.result);
    assert_eq!(second.processed_at, first.processed_at);
    assert!(p.queue.is_empty());

    let success: Vec<_> = sub
        .drain()
        .into_iter()
        .filter(|e| e.detail_type() == DETAIL_SUCCESS)
        .collect();
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].detail().event_id, "success-order-o1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_a_single_winner() {
    let (p, _clock) = setup();
    let key = IdempotencyKey::new("shared").unwrap();
    let payload = json!({"orderId": "o1", "amount": 1});

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = p.context.ledger.clone();
            let request = ClaimRequest::new(
                key.clone(),
                &payload,
                RequestId::new(),
                ingestflow_core::MessageId::new(),
            );
            tokio::spawn(async move { ledger.claim(request).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::New => winners += 1,
            ClaimOutcome::DuplicateInflight => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn transient_failures_dead_letter_and_redrive_respects_age() {
    let (p, clock) = setup();
    p.context.faults.set_mode(FailureMode::RandomFailP30);
    let ingest = IngestService::new(p.context.clone());

    // Ingest until at least one message id is in the failing bucket.
    let mut doomed = Vec::new();
    for n in 0..500 {
        let receipt = ingest
            .ingest(json!({"orderId": format!("o{n}"), "amount": 10}), RequestId::new())
            .await
            .unwrap();
        if fault::decide(&FailureMode::RandomFailP30, &receipt.message_id).is_some() {
            doomed.push(receipt.message_id);
            break;
        }
    }
    assert_eq!(doomed.len(), 1);

    // Only advance time once nothing is visible, so the dead letter stays
    // younger than the redrive age floor.
    for _ in 0..1_000 {
        if p.queue.is_empty() {
            break;
        }
        if drain_once(&p).await == 0 {
            clock.advance(chrono::Duration::seconds(31));
        }
    }
    assert!(p.queue.is_empty());
    assert_eq!(p.dead_letter_queue.len(), 1);

    let engine = RedriveEngine::new(p.context.clone());
    let preview = engine
        .preview(PreviewRequest {
            min_age_seconds: Some(0),
            ..PreviewRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(preview.dlq_stats.total_messages, 1);
    assert_eq!(preview.preview_messages.len(), 1);
    assert_eq!(preview.preview_messages[0].message_id, doomed[0]);
    // Five worker deliveries plus the preview's own receive.
    assert_eq!(preview.preview_messages[0].receive_count, 6);

    // Younger than the default five minute floor: left alone.
    let stats = engine
        .start(StartRequest {
            min_age_seconds: Some(300),
            ..StartRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.initial_dlq_count, 1);
    assert_eq!(stats.redriven_messages, 0);
    assert_eq!(stats.skipped_messages, 1);
    assert_eq!(p.dead_letter_queue.len(), 1);

    clock.advance(chrono::Duration::minutes(10));
    let stats = engine
        .start(StartRequest {
            min_age_seconds: Some(300),
            per_message_delay_jitter: Some(0),
            ..StartRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(stats.redriven_messages, 1);
    assert!(p.dead_letter_queue.is_empty());
    assert_eq!(p.queue.len(), 1);
}

#[tokio::test]
async fn failure_mode_switch_takes_effect_on_the_next_message() {
    let (p, _clock) = setup();
    let ingest = IngestService::new(p.context.clone());

    ingest
        .ingest(json!({"orderId": "o1", "amount": 5}), RequestId::new())
        .await
        .unwrap();

    p.context.faults.set_mode(FailureMode::PoisonPayload);
    assert!(
        ingest
            .ingest(json!({"orderId": "o2", "amount": 5}), RequestId::new())
            .await
            .is_err()
    );

    p.context.faults.set_mode(FailureMode::None);
    drain_once(&p).await;
    assert!(p.queue.is_empty());
    assert_eq!(p.ledger.len(), 1);
}
