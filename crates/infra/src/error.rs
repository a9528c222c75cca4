//! Pipeline error taxonomy.

use thiserror::Error;

use ingestflow_core::DomainError;

use crate::ledger::LedgerError;
use crate::queue::QueueError;
use crate::resilience::BreakerError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Rejected at ingress; never queued, never retried.
    #[error("{0}")]
    Validation(String),

    /// Simulated ingress schema rejection.
    #[error("Simulated schema validation error")]
    SchemaValidation,

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Transient(String),

    /// Business logic rejected the order.
    #[error("{0}")]
    Processing(String),

    /// Ledger or queue infrastructure failure.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("circuit breaker open for {dependency}")]
    CircuitOpen { dependency: String },
}

impl PipelineError {
    /// Stable name used in notifications and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "ValidationError",
            PipelineError::SchemaValidation => "SchemaValidationError",
            PipelineError::Timeout(_) => "TimeoutError",
            PipelineError::Transient(_) => "TransientError",
            PipelineError::Processing(_) => "ProcessingError",
            PipelineError::StorageUnavailable(_) => "StorageUnavailable",
            PipelineError::CircuitOpen { .. } => "CircuitOpen",
        }
    }

    /// Whether redelivery may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation(_) | PipelineError::SchemaValidation
        )
    }
}

impl From<DomainError> for PipelineError {
    fn from(value: DomainError) -> Self {
        PipelineError::Validation(value.message().to_string())
    }
}

impl From<LedgerError> for PipelineError {
    fn from(value: LedgerError) -> Self {
        PipelineError::StorageUnavailable(value.to_string())
    }
}

impl From<QueueError> for PipelineError {
    fn from(value: QueueError) -> Self {
        PipelineError::StorageUnavailable(value.to_string())
    }
}

impl From<BreakerError> for PipelineError {
    fn from(value: BreakerError) -> Self {
        PipelineError::CircuitOpen {
            dependency: value.dependency,
        }
    }
}
