//! Background worker pool.
//!
//! Each worker task polls the primary queue, processes one batch at a time
//! and deletes the messages it acknowledged. NACKed messages are simply left
//! alone; the queue redelivers them after the visibility timeout.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingestflow_core::RequestId;

use crate::context::PipelineContext;
use crate::queue::MessageQueue;
use crate::resilience::{GuardedError, QUEUE};

use super::processor::MessageProcessor;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub concurrency: usize,
    pub batch_size: usize,
    /// Sleep between polls that returned nothing.
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    /// How often expired ledger records are purged. `None` disables it.
    pub purge_interval: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "ingest-worker".to_string(),
            concurrency: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(30),
            purge_interval: Some(Duration::from_secs(3600)),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_pipeline(config: &crate::config::PipelineConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            batch_size: config.worker_batch_size,
            poll_interval: config.worker_poll_interval,
            visibility_timeout: config.visibility_timeout,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub batches: u64,
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub delete_failures: u64,
    pub receive_failures: u64,
    pub records_purged: u64,
    pub uptime_secs: u64,
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop polling, preempt slow-downstream waits and wait for every task.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

/// Bounded pool of queue consumers.
#[derive(Debug)]
pub struct WorkerPool {
    ctx: PipelineContext,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(ctx: PipelineContext, config: WorkerPoolConfig) -> Self {
        Self { ctx, config }
    }

    /// Spawn the workers (and the ledger purge loop) on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);

        for index in 0..self.config.concurrency.max(1) {
            let worker = Worker {
                name: format!("{}-{}", self.config.name, index),
                processor: MessageProcessor::with_cancellation(self.ctx.clone(), shutdown.child_token()),
                ctx: self.ctx.clone(),
                config: self.config.clone(),
                stats: stats.clone(),
            };
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move { worker.run(token).await }));
        }

        if let Some(interval) = self.config.purge_interval {
            let ctx = self.ctx.clone();
            let token = shutdown.clone();
            let stats = stats.clone();
            tasks.push(tokio::spawn(async move {
                purge_loop(ctx, interval, token, stats).await
            }));
        }

        info!(pool = %self.config.name, workers = self.config.concurrency, "worker pool started");

        WorkerPoolHandle {
            shutdown,
            tasks,
            stats,
            started: Instant::now(),
        }
    }
}

struct Worker {
    name: String,
    ctx: PipelineContext,
    processor: MessageProcessor,
    config: WorkerPoolConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = %self.name, "worker started");

        while !shutdown.is_cancelled() {
            let polled = self.poll_once().await;
            if polled == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        debug!(worker = %self.name, "worker stopped");
    }

    /// Receive and handle one batch. Returns how many messages were received.
    async fn poll_once(&self) -> usize {
        let queue = self.ctx.queue.clone();
        let batch = match self
            .ctx
            .breakers
            .get(QUEUE)
            .call(
                || queue.receive(self.config.batch_size, self.config.visibility_timeout),
                |e: &crate::queue::QueueError| e.is_unavailable(),
            )
            .await
        {
            Ok(batch) => batch,
            Err(GuardedError::Open(e)) => {
                debug!(worker = %self.name, error = %e, "queue breaker open; backing off");
                return 0;
            }
            Err(GuardedError::Inner(e)) => {
                warn!(worker = %self.name, error = %e, "receive failed");
                lock(&self.stats).receive_failures += 1;
                return 0;
            }
        };

        if batch.is_empty() {
            return 0;
        }

        let request_id = RequestId::new();
        let response = self.processor.process_batch(&batch, request_id).await;
        let failed: Vec<_> = response.failed_ids().collect();

        let mut acked = 0u64;
        let mut delete_failures = 0u64;
        for message in batch.iter().filter(|m| !failed.contains(&m.id)) {
            match self.ctx.queue.delete(&message.receipt_handle).await {
                Ok(()) => acked += 1,
                Err(e) => {
                    // The message will be redelivered; the ledger turns that
                    // into a duplicate.
                    warn!(worker = %self.name, message_id = %message.id, error = %e, "failed to delete acknowledged message");
                    delete_failures += 1;
                }
            }
        }

        let mut stats = lock(&self.stats);
        stats.batches += 1;
        stats.messages_received += batch.len() as u64;
        stats.messages_acked += acked;
        stats.messages_nacked += failed.len() as u64;
        stats.delete_failures += delete_failures;

        batch.len()
    }
}

async fn purge_loop(
    ctx: PipelineContext,
    interval: Duration,
    shutdown: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match ctx.ledger.purge_expired(ctx.clock.now()).await {
            Ok(0) => {}
            Ok(purged) => {
                info!(purged, "purged expired ledger records");
                lock(&stats).records_purged += purged as u64;
            }
            Err(e) => warn!(error = %e, "ledger purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use ingestflow_core::IdempotencyKey;

    use crate::config::PipelineConfig;
    use crate::context::InMemoryPipeline;
    use crate::ledger::{IdempotencyLedger, RecordStatus};
    use crate::queue::OutgoingMessage;

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_processes_and_deletes_messages() {
        let p = InMemoryPipeline::new(PipelineConfig::default());
        for i in 0..5 {
            let body = json!({"idempotencyKey": format!("k{i}"), "orderId": format!("o{i}"), "amount": 10});
            p.queue.send(OutgoingMessage::new(body.to_string())).await.unwrap();
        }

        let config = WorkerPoolConfig {
            poll_interval: Duration::from_millis(5),
            purge_interval: None,
            ..WorkerPoolConfig::default()
        }
        .with_concurrency(2);
        let handle = WorkerPool::new(p.context.clone(), config).spawn();

        let queue = p.queue.clone();
        wait_until(|| queue.is_empty()).await;

        let stats = handle.shutdown().await;
        assert_eq!(stats.messages_acked, 5);
        assert_eq!(stats.messages_nacked, 0);

        let record = p.ledger.get(&IdempotencyKey::new("k3").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Succeeded);
    }

    #[tokio::test]
    async fn nacked_messages_stay_on_the_queue() {
        let p = InMemoryPipeline::new(PipelineConfig::default());
        let body = json!({"idempotencyKey": "big", "orderId": "o", "amount": 99999});
        p.queue.send(OutgoingMessage::new(body.to_string())).await.unwrap();

        let config = WorkerPoolConfig {
            poll_interval: Duration::from_millis(5),
            purge_interval: None,
            ..WorkerPoolConfig::default()
        }
        .with_concurrency(1);
        let handle = WorkerPool::new(p.context.clone(), config).spawn();

        let stats_probe = || handle.stats().messages_nacked == 1;
        wait_until(stats_probe).await;

        let stats = handle.shutdown().await;
        assert_eq!(stats.messages_acked, 0);
        assert_eq!(p.queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let p = InMemoryPipeline::new(PipelineConfig::default());
        let handle = WorkerPool::new(p.context.clone(), WorkerPoolConfig::default()).spawn();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("pool should stop promptly");
        assert_eq!(stats.batches, 0);
    }
}
