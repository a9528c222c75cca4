//! Pipeline infrastructure: ledger, queues, workers, redrive, resilience.

pub mod config;
pub mod context;
pub mod error;
pub mod fault;
pub mod ingest;
pub mod ledger;
pub mod queue;
pub mod redrive;
pub mod resilience;
pub mod worker;

pub use config::{ConfigError, PipelineConfig};
pub use context::{InMemoryPipeline, PipelineContext};
pub use error::PipelineError;
pub use ingest::{IngestReceipt, IngestService};

#[cfg(test)]
mod integration_tests;
