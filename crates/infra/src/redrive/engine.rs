//! Dead-letter redrive: preview, start and cancel.
//!
//! Both preview and start keep every message they receive invisible until
//! the run ends and then release the ones they did not move, so a single
//! run never sees the same message twice and the queue is left as found.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use ingestflow_core::MessageId;

use crate::context::PipelineContext;
use crate::queue::{MAX_DELAY, MAX_RECEIVE_BATCH, MessageQueue, OutgoingMessage, QueueError, QueueMessage, ReceiptHandle};
use crate::resilience::{redrive_delay, spread_jitter};

use super::filter::{ErrorCategory, MessageFilter, age_seconds, categorize};

pub const PREVIEW_DEFAULT_MESSAGES: usize = 20;
pub const PREVIEW_MAX_MESSAGES: usize = 100;
pub const PREVIEW_VISIBILITY: Duration = Duration::from_secs(30);

pub const START_DEFAULT_MESSAGES: usize = 100;
pub const START_MAX_MESSAGES: usize = 1000;
pub const START_VISIBILITY: Duration = Duration::from_secs(300);
pub const START_DEFAULT_MIN_AGE_SECS: i64 = 300;
/// Redrive never touches messages younger than this.
pub const MIN_AGE_FLOOR_SECS: i64 = 60;
pub const DEFAULT_JITTER_MINUTES: u32 = 5;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RedriveError {
    #[error("{0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub max_messages: Option<usize>,
    pub error_type: Option<String>,
    pub min_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub max_messages: Option<usize>,
    pub error_type: Option<String>,
    pub min_age_seconds: Option<i64>,
    /// Extra per-message delay spread, in minutes.
    pub per_message_delay_jitter: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    pub total_messages: usize,
    pub in_flight_messages: usize,
    pub available_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewMessage {
    pub message_id: MessageId,
    /// Parsed JSON, or the raw text when the body is not JSON.
    pub body: JsonValue,
    pub age_seconds: i64,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<DateTime<Utc>>,
    pub message_attributes: BTreeMap<String, String>,
    pub error_category: ErrorCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewFilters {
    pub max_messages: usize,
    pub error_type: String,
    pub min_age_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub dlq_stats: DlqStats,
    pub preview_messages: Vec<PreviewMessage>,
    pub filters: PreviewFilters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedriveStats {
    pub initial_dlq_count: usize,
    pub processed_messages: usize,
    pub redriven_messages: usize,
    pub skipped_messages: usize,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub message: String,
    pub cancelled_runs: usize,
}

/// Redrive operations against the context's dead-letter queue.
#[derive(Debug)]
pub struct RedriveEngine {
    ctx: PipelineContext,
    active: Mutex<HashMap<u64, CancellationToken>>,
    next_run: AtomicU64,
}

impl RedriveEngine {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            active: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        }
    }

    fn dlq(&self) -> &dyn MessageQueue {
        self.ctx.dead_letter_queue.as_ref()
    }

    /// Sample dead-letter messages without moving them.
    #[instrument(skip(self, request), fields(max_messages = ?request.max_messages), err)]
    pub async fn preview(&self, request: PreviewRequest) -> Result<PreviewResponse, RedriveError> {
        let max_messages = request
            .max_messages
            .unwrap_or(PREVIEW_DEFAULT_MESSAGES)
            .min(PREVIEW_MAX_MESSAGES);
        let error_type = request.error_type.unwrap_or_default();
        let min_age_seconds = request.min_age_seconds.unwrap_or(0);
        if min_age_seconds < 0 {
            return Err(RedriveError::InvalidParameter(
                "minAgeSeconds must not be negative".to_string(),
            ));
        }

        let filter = MessageFilter::new(error_type.clone(), min_age_seconds as u64);
        let depth = self.dlq().depth().await?;

        let mut held = Vec::new();
        let mut previews = Vec::new();
        let sampled = async {
            while previews.len() < max_messages {
                let want = (max_messages - previews.len()).min(MAX_RECEIVE_BATCH);
                let batch = self.dlq().receive(want, PREVIEW_VISIBILITY).await?;
                if batch.is_empty() {
                    break;
                }

                let now = self.ctx.clock.now();
                held.extend(batch.iter().map(|m| m.receipt_handle.clone()));
                for message in &batch {
                    if previews.len() >= max_messages {
                        break;
                    }
                    if filter.matches(message, now) {
                        previews.push(preview_of(message, now));
                    }
                }
            }
            Ok::<(), QueueError>(())
        }
        .await;

        self.release(&held).await;
        sampled?;

        info!(
            total_messages = depth.total(),
            previewed = previews.len(),
            "dead-letter preview completed"
        );

        Ok(PreviewResponse {
            dlq_stats: DlqStats {
                total_messages: depth.total(),
                in_flight_messages: depth.in_flight,
                available_messages: depth.available,
            },
            preview_messages: previews,
            filters: PreviewFilters {
                max_messages,
                error_type,
                min_age_seconds,
            },
            timestamp: self.ctx.clock.now(),
        })
    }

    /// Move eligible dead-letter messages back to the primary queue.
    pub async fn start(&self, request: StartRequest) -> Result<RedriveStats, RedriveError> {
        self.start_with_token(request, CancellationToken::new()).await
    }

    /// Like [`start`](Self::start) with a caller-supplied token; the run is
    /// also registered so [`cancel`](Self::cancel) reaches it.
    #[instrument(skip(self, request, token), err)]
    pub async fn start_with_token(
        &self,
        request: StartRequest,
        token: CancellationToken,
    ) -> Result<RedriveStats, RedriveError> {
        let max_messages = request
            .max_messages
            .unwrap_or(START_DEFAULT_MESSAGES)
            .min(START_MAX_MESSAGES);
        let min_age_seconds = request.min_age_seconds.unwrap_or(START_DEFAULT_MIN_AGE_SECS);
        if min_age_seconds < MIN_AGE_FLOOR_SECS {
            return Err(RedriveError::InvalidParameter(format!(
                "Minimum age must be at least {MIN_AGE_FLOOR_SECS} seconds for safety"
            )));
        }
        let jitter_minutes = request.per_message_delay_jitter.unwrap_or(DEFAULT_JITTER_MINUTES);
        let filter = MessageFilter::new(request.error_type.unwrap_or_default(), min_age_seconds as u64);

        info!(
            max_messages,
            min_age_seconds,
            error_type = %filter.error_type,
            jitter_minutes,
            "starting redrive"
        );

        let initial = self.dlq().depth().await?.available;
        if initial == 0 {
            return Ok(RedriveStats {
                completed_at: Some(self.ctx.clock.now()),
                ..RedriveStats::default()
            });
        }

        let _run = self.register(token.clone());
        let mut stats = RedriveStats {
            initial_dlq_count: initial,
            ..RedriveStats::default()
        };
        let mut held: Vec<ReceiptHandle> = Vec::new();

        while stats.processed_messages < max_messages {
            if token.is_cancelled() {
                warn!(processed = stats.processed_messages, "redrive cancelled");
                stats.cancelled = true;
                break;
            }

            let want = (max_messages - stats.processed_messages).min(MAX_RECEIVE_BATCH);
            let batch = match self.dlq().receive(want, START_VISIBILITY).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to read dead-letter queue; stopping redrive");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let now = self.ctx.clock.now();
            for message in batch {
                stats.processed_messages += 1;

                if !filter.matches(&message, now) {
                    held.push(message.receipt_handle);
                    stats.skipped_messages += 1;
                    continue;
                }

                match self.redrive_one(&message, jitter_minutes).await {
                    Ok(delay) => {
                        stats.redriven_messages += 1;
                        info!(
                            message_id = %message.id,
                            error_category = ?categorize(&message),
                            delay_secs = delay.as_secs(),
                            "message redriven"
                        );
                    }
                    Err(e) => {
                        error!(message_id = %message.id, error = %e, "failed to redrive message");
                        held.push(message.receipt_handle);
                        stats.skipped_messages += 1;
                    }
                }
            }
        }

        self.release(&held).await;

        stats.completed_at = Some(self.ctx.clock.now());
        info!(
            processed = stats.processed_messages,
            redriven = stats.redriven_messages,
            skipped = stats.skipped_messages,
            cancelled = stats.cancelled,
            "redrive finished"
        );
        Ok(stats)
    }

    /// Trip every running start.
    pub fn cancel(&self) -> CancelResponse {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        for token in active.values() {
            token.cancel();
        }
        let cancelled_runs = active.len();
        info!(cancelled_runs, "redrive cancellation requested");

        CancelResponse {
            message: if cancelled_runs == 0 {
                "Redrive cancellation acknowledged; no active redrive runs".to_string()
            } else {
                format!("Redrive cancellation requested for {cancelled_runs} active run(s)")
            },
            cancelled_runs,
        }
    }

    pub fn active_runs(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    async fn redrive_one(&self, message: &QueueMessage, jitter_minutes: u32) -> Result<Duration, QueueError> {
        let delay = (redrive_delay(message.receive_count) + spread_jitter(jitter_minutes)).min(MAX_DELAY);

        let outgoing = OutgoingMessage::new(message.body.clone())
            .with_attributes(message.attributes.clone())
            .with_delay(delay);
        self.ctx.queue.send(outgoing).await?;
        self.dlq().delete(&message.receipt_handle).await?;
        Ok(delay)
    }

    async fn release(&self, held: &[ReceiptHandle]) {
        for receipt in held {
            if let Err(e) = self.dlq().change_visibility(receipt, Duration::ZERO).await {
                warn!(error = %e, "failed to release dead-letter message");
            }
        }
    }

    fn register(&self, token: CancellationToken) -> ActiveRun<'_> {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, token);
        ActiveRun {
            active: &self.active,
            id,
        }
    }
}

/// Keeps a run visible to `cancel` until dropped, including when the
/// caller abandons the start future mid-run.
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<u64, CancellationToken>>,
    id: u64,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

fn preview_of(message: &QueueMessage, now: DateTime<Utc>) -> PreviewMessage {
    let body = serde_json::from_str(&message.body).unwrap_or_else(|_| JsonValue::String(message.body.clone()));
    PreviewMessage {
        message_id: message.id,
        body,
        age_seconds: age_seconds(message, now),
        receive_count: message.receive_count,
        first_receive_timestamp: message.first_receive_timestamp,
        message_attributes: message.attributes.clone(),
        error_category: categorize(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ingestflow_core::ManualClock;

    use crate::config::PipelineConfig;
    use crate::context::InMemoryPipeline;
    use crate::queue::ATTR_ERROR_TYPE_CANDIDATE;

    fn setup() -> (Arc<ManualClock>, InMemoryPipeline, RedriveEngine) {
        let clock = Arc::new(ManualClock::starting_now());
        let pipeline = InMemoryPipeline::with_clock(PipelineConfig::default(), clock.clone());
        let engine = RedriveEngine::new(pipeline.context.clone());
        (clock, pipeline, engine)
    }

    async fn dead_letter(p: &InMemoryPipeline, body: &str, candidate: &str) {
        p.dead_letter_queue
            .send(OutgoingMessage::new(body).with_attribute(ATTR_ERROR_TYPE_CANDIDATE, candidate))
            .await
            .unwrap();
    }

    fn start(min_age: i64) -> StartRequest {
        StartRequest {
            min_age_seconds: Some(min_age),
            per_message_delay_jitter: Some(0),
            ..StartRequest::default()
        }
    }

    #[tokio::test]
    async fn preview_leaves_queue_unchanged() {
        let (_clock, p, engine) = setup();
        dead_letter(&p, r#"{"idempotencyKey":"a"}"#, "TransientError").await;
        dead_letter(&p, "not json", "none").await;

        let preview = engine.preview(PreviewRequest::default()).await.unwrap();

        assert_eq!(preview.dlq_stats.total_messages, 2);
        assert_eq!(preview.preview_messages.len(), 2);
        assert_eq!(preview.preview_messages[0].body["idempotencyKey"], "a");
        assert_eq!(preview.preview_messages[0].error_category, ErrorCategory::Transient);
        assert_eq!(preview.preview_messages[1].body, JsonValue::String("not json".to_string()));
        assert_eq!(preview.filters.max_messages, PREVIEW_DEFAULT_MESSAGES);

        let depth = p.dead_letter_queue.depth().await.unwrap();
        assert_eq!((depth.available, depth.in_flight), (2, 0));
    }

    #[tokio::test]
    async fn preview_caps_and_filters() {
        let (clock, p, engine) = setup();
        for _ in 0..3 {
            dead_letter(&p, "{}", "TimeoutError").await;
        }
        clock.advance(chrono::Duration::seconds(120));
        dead_letter(&p, "{}", "TransientError").await;

        let aged = engine
            .preview(PreviewRequest {
                min_age_seconds: Some(60),
                ..PreviewRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(aged.preview_messages.len(), 3);

        let capped = engine
            .preview(PreviewRequest {
                max_messages: Some(500),
                error_type: Some("transient".to_string()),
                ..PreviewRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.filters.max_messages, PREVIEW_MAX_MESSAGES);
        assert_eq!(capped.preview_messages.len(), 1);
    }

    #[tokio::test]
    async fn preview_rejects_negative_age() {
        let (_clock, _p, engine) = setup();
        let err = engine
            .preview(PreviewRequest {
                min_age_seconds: Some(-1),
                ..PreviewRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RedriveError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn start_rejects_unsafe_min_age() {
        let (_clock, _p, engine) = setup();
        let err = engine.start(start(30)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Minimum age must be at least 60 seconds for safety"
        );
    }

    #[tokio::test]
    async fn start_on_empty_queue_returns_zero_stats() {
        let (_clock, _p, engine) = setup();
        let stats = engine.start(start(300)).await.unwrap();
        assert_eq!(stats.initial_dlq_count, 0);
        assert_eq!(stats.processed_messages, 0);
        assert!(stats.completed_at.is_some());
    }

    #[tokio::test]
    async fn start_only_moves_messages_past_the_age_floor() {
        let (clock, p, engine) = setup();
        dead_letter(&p, r#"{"idempotencyKey":"old"}"#, "TransientError").await;
        clock.advance(chrono::Duration::seconds(200));
        dead_letter(&p, r#"{"idempotencyKey":"young"}"#, "TransientError").await;
        clock.advance(chrono::Duration::seconds(150));

        let stats = engine.start(start(300)).await.unwrap();
        assert_eq!(stats.initial_dlq_count, 2);
        assert_eq!(stats.processed_messages, 2);
        assert_eq!(stats.redriven_messages, 1);
        assert_eq!(stats.skipped_messages, 1);

        // The skipped message is back and visible.
        let depth = p.dead_letter_queue.depth().await.unwrap();
        assert_eq!((depth.available, depth.in_flight), (1, 0));

        // The moved message sits on the primary queue with its attributes.
        assert_eq!(p.queue.len(), 1);
        clock.advance(chrono::Duration::seconds(900));
        let moved = p.queue.receive(1, Duration::from_secs(30)).await.unwrap().remove(0);
        assert!(moved.body.contains("old"));
        assert_eq!(moved.attribute(ATTR_ERROR_TYPE_CANDIDATE), Some("TransientError"));
    }

    #[tokio::test]
    async fn start_respects_error_type_and_max_messages() {
        let (clock, p, engine) = setup();
        for _ in 0..12 {
            dead_letter(&p, "{}", "TransientError").await;
        }
        dead_letter(&p, "{}", "TimeoutError").await;
        clock.advance(chrono::Duration::seconds(600));

        let stats = engine
            .start(StartRequest {
                max_messages: Some(5),
                ..start(300)
            })
            .await
            .unwrap();
        assert_eq!(stats.processed_messages, 5);
        assert_eq!(stats.redriven_messages, 5);

        let stats = engine
            .start(StartRequest {
                error_type: Some("timeout".to_string()),
                ..start(300)
            })
            .await
            .unwrap();
        assert_eq!(stats.processed_messages, 8);
        assert_eq!(stats.redriven_messages, 1);
        assert_eq!(stats.skipped_messages, 7);
    }

    #[tokio::test]
    async fn cancelled_run_stops_between_batches() {
        let (clock, p, engine) = setup();
        dead_letter(&p, "{}", "TransientError").await;
        clock.advance(chrono::Duration::seconds(600));

        let token = CancellationToken::new();
        token.cancel();
        let stats = engine.start_with_token(start(300), token).await.unwrap();

        assert!(stats.cancelled);
        assert_eq!(stats.processed_messages, 0);
        assert_eq!(engine.active_runs(), 0);
        assert_eq!(p.dead_letter_queue.depth().await.unwrap().available, 1);
    }

    #[test]
    fn cancel_trips_registered_runs() {
        let (_clock, _p, engine) = setup();
        assert_eq!(engine.cancel().cancelled_runs, 0);

        let token = CancellationToken::new();
        let run = engine.register(token.clone());
        let response = engine.cancel();

        assert_eq!(response.cancelled_runs, 1);
        assert!(token.is_cancelled());
        drop(run);
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test]
    async fn abandoned_run_is_forgotten_by_cancel() {
        let (clock, p, engine) = setup();
        dead_letter(&p, "{}", "TransientError").await;
        clock.advance(chrono::Duration::seconds(600));

        {
            let _first = engine.register(CancellationToken::new());
            let _second = engine.register(CancellationToken::new());
            assert_eq!(engine.active_runs(), 2);
        }
        assert_eq!(engine.cancel().cancelled_runs, 0);

        let stats = engine.start(start(300)).await.unwrap();
        assert_eq!(stats.redriven_messages, 1);
        assert_eq!(engine.active_runs(), 0);
    }
}
