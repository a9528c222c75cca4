//! Shared pipeline dependencies.
//!
//! A [`PipelineContext`] is built once at startup and cloned into every
//! component (ingest, workers, redrive, HTTP handlers). Nothing in the
//! pipeline reaches for process-global state.

use std::sync::Arc;

use tracing::warn;

use ingestflow_core::{Clock, SystemClock};
use ingestflow_events::{EventBus, InMemoryEventBus, NotificationEnvelope, ProcessingNotification};

use crate::config::PipelineConfig;
use crate::fault::FaultInjector;
use crate::ledger::{IdempotencyLedger, InMemoryLedger};
use crate::queue::{InMemoryQueue, MessageQueue};
use crate::resilience::{BreakerRegistry, EVENT_BUS};
use crate::worker::{OrderProcessor, TaxCalculator};

pub type NotificationBus = dyn EventBus<NotificationEnvelope>;

/// Name stamped on business results.
pub const PROCESSED_BY: &str = "ingestflow-worker";

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letter_queue: Arc<dyn MessageQueue>,
    pub bus: Arc<NotificationBus>,
    pub breakers: Arc<BreakerRegistry>,
    pub faults: Arc<FaultInjector>,
    pub processor: Arc<dyn OrderProcessor>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("env", &self.config.env_name)
            .field("queue", &self.queue.name())
            .field("dead_letter_queue", &self.dead_letter_queue.name())
            .field("failure_mode", &self.faults.mode())
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Publish a notification stamped with the current time.
    ///
    /// Best effort: failures (including an open `event-bus` breaker) are
    /// logged and dropped.
    pub fn publish(&self, notification: ProcessingNotification) {
        let breaker = self.breakers.get(EVENT_BUS);
        if let Err(e) = breaker.try_acquire() {
            warn!(
                event_id = %notification.event_id,
                error = %e,
                "skipping notification; event bus breaker open"
            );
            return;
        }

        let event_id = notification.event_id.clone();
        match self.bus.publish(notification.into_envelope(self.clock.now())) {
            Ok(()) => breaker.on_success(),
            Err(e) => {
                breaker.on_failure();
                warn!(event_id = %event_id, error = %e, "failed to publish notification");
            }
        }
    }
}

/// In-memory wiring with typed handles, so tests and dev mode can reach the
/// concrete stores (availability switches, inspection).
#[derive(Debug)]
pub struct InMemoryPipeline {
    pub context: PipelineContext,
    pub ledger: Arc<InMemoryLedger>,
    pub queue: Arc<InMemoryQueue>,
    pub dead_letter_queue: Arc<InMemoryQueue>,
    pub bus: Arc<InMemoryEventBus<NotificationEnvelope>>,
}

impl InMemoryPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let ledger = Arc::new(InMemoryLedger::with_ttl(clock.clone(), config.ledger_ttl));
        let dead_letter_queue = Arc::new(InMemoryQueue::new("ingest-dlq", clock.clone()));
        let queue = Arc::new(
            InMemoryQueue::new("ingest-queue", clock.clone())
                .with_dead_letter(dead_letter_queue.clone(), config.max_receive_count),
        );
        let bus = Arc::new(InMemoryEventBus::new());

        let context = PipelineContext {
            faults: Arc::new(FaultInjector::new(config.failure_mode.clone())),
            breakers: Arc::new(BreakerRegistry::new(clock.clone())),
            processor: Arc::new(TaxCalculator::new(PROCESSED_BY, clock.clone())),
            config: Arc::new(config),
            clock,
            ledger: ledger.clone(),
            queue: queue.clone(),
            dead_letter_queue: dead_letter_queue.clone(),
            bus: bus.clone(),
        };

        Self {
            context,
            ledger,
            queue,
            dead_letter_queue,
            bus,
        }
    }
}
