//! Service wiring: pipeline context, ingest, redrive engine, worker pool.

use std::sync::{Arc, Mutex, MutexGuard};

use ingestflow_infra::config::PipelineConfig;
use ingestflow_infra::context::{InMemoryPipeline, PipelineContext};
use ingestflow_infra::ingest::IngestService;
use ingestflow_infra::redrive::RedriveEngine;
use ingestflow_infra::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Debug)]
pub struct AppServices {
    pub ctx: PipelineContext,
    pub ingest: IngestService,
    pub redrive: RedriveEngine,
    workers: Mutex<Option<WorkerPoolHandle>>,
}

impl AppServices {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ingest: IngestService::new(ctx.clone()),
            redrive: RedriveEngine::new(ctx.clone()),
            ctx,
            workers: Mutex::new(None),
        }
    }

    /// Spawn the worker pool on the current runtime and keep its handle.
    pub fn start_workers(&self) {
        let config = WorkerPoolConfig::from_pipeline(&self.ctx.config);
        let handle = WorkerPool::new(self.ctx.clone(), config).spawn();
        if let Some(previous) = self.workers().replace(handle) {
            previous.shutdown_token().cancel();
        }
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.workers().as_ref().map(WorkerPoolHandle::stats)
    }

    /// Stop the pool, if running, and wait for in-flight batches.
    pub async fn shutdown_workers(&self) -> Option<WorkerStats> {
        let handle = self.workers().take()?;
        Some(handle.shutdown().await)
    }

    fn workers(&self) -> MutexGuard<'_, Option<WorkerPoolHandle>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-memory pipeline; with the `postgres` feature and `DATABASE_URL` set,
/// the ledger is backed by Postgres instead.
pub async fn build_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    #[allow(unused_mut)]
    let mut ctx = InMemoryPipeline::new(config).context;

    #[cfg(feature = "postgres")]
    if let Some(url) = ctx.config.database_url.clone() {
        let ledger = ingestflow_infra::ledger::PostgresLedger::connect(
            &url,
            ctx.clock.clone(),
            ctx.config.ledger_ttl,
        )
        .await?;
        tracing::info!("using postgres idempotency ledger");
        ctx.ledger = Arc::new(ledger);
    }

    Ok(AppServices::new(ctx))
}

/// Same wiring with the typed in-memory handles kept, for tests.
pub fn in_memory_services(config: PipelineConfig) -> (Arc<AppServices>, InMemoryPipeline) {
    let pipeline = InMemoryPipeline::new(config);
    let services = Arc::new(AppServices::new(pipeline.context.clone()));
    (services, pipeline)
}
