//! Idempotency ledger: one processing record per logical event.
//!
//! ## Protocol
//!
//! ```text
//!            claim (absent)          complete
//!   ∅ ─────────────────────▶ INFLIGHT ─────────▶ SUCCEEDED (terminal)
//!                              │  ▲
//!                         fail │  │ claim (attempts + 1)
//!                              ▼  │
//!                             FAILED
//! ```
//!
//! `claim` is the only linearization point in the pipeline: for one key,
//! concurrent claimants race on a single conditional write and exactly one
//! of them observes `New`/`Retry`. Losing that race is a normal outcome
//! (`DuplicateInflight` / `DuplicateSucceeded`), not an error. Storage
//! failures are surfaced as [`LedgerError::Unavailable`] and never
//! swallowed.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use ingestflow_core::{IdempotencyKey, MessageId, RequestId, checksum};

pub use in_memory::InMemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;

/// Default record lifetime before garbage collection.
pub const DEFAULT_RECORD_TTL_DAYS: i64 = 7;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Inflight,
    Succeeded,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Inflight => "INFLIGHT",
            RecordStatus::Succeeded => "SUCCEEDED",
            RecordStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFLIGHT" => Some(RecordStatus::Inflight),
            "SUCCEEDED" => Some(RecordStatus::Succeeded),
            "FAILED" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub status: RecordStatus,
    /// Integrity hint over the payload that created the record. Never
    /// compared on duplicate detection.
    pub checksum: String,
    pub first_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub request_id: RequestId,
    pub message_id: MessageId,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
}

/// Input to [`IdempotencyLedger::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub key: IdempotencyKey,
    pub checksum: String,
    pub request_id: RequestId,
    pub message_id: MessageId,
}

impl ClaimRequest {
    pub fn new(
        key: IdempotencyKey,
        payload: &JsonValue,
        request_id: RequestId,
        message_id: MessageId,
    ) -> Self {
        Self {
            key,
            checksum: checksum(payload),
            request_id,
            message_id,
        }
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// No record existed; one was created INFLIGHT with `attempts = 1`.
    New,
    /// A FAILED record was re-claimed (INFLIGHT again).
    Retry { attempts: u32 },
    /// The key already SUCCEEDED; the stored record is returned unchanged.
    DuplicateSucceeded(Box<IdempotencyRecord>),
    /// Another attempt holds the claim; do not process, do not acknowledge.
    DuplicateInflight,
}

impl ClaimOutcome {
    /// Whether the caller now holds the claim and must run the business logic.
    pub fn should_process(&self) -> bool {
        matches!(self, ClaimOutcome::New | ClaimOutcome::Retry { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::New => "NEW",
            ClaimOutcome::Retry { .. } => "RETRY",
            ClaimOutcome::DuplicateSucceeded(_) => "DUPLICATE_SUCCEEDED",
            ClaimOutcome::DuplicateInflight => "DUPLICATE_INFLIGHT",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// Storage is unreachable or refused the operation. Always transient.
    #[error("ledger storage unavailable: {0}")]
    Unavailable(String),

    #[error("no ledger record for key {0}")]
    NotFound(IdempotencyKey),

    #[error("cannot move record {key} from {from} to {to}")]
    InvalidTransition {
        key: IdempotencyKey,
        from: RecordStatus,
        to: RecordStatus,
    },

    #[error("ledger record could not be decoded: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Whether the failure is an infrastructure fault (as opposed to a
    /// protocol violation by the caller).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Ledger storage contract.
///
/// Backends must provide a conditional insert-if-absent and a conditional
/// update-if-status-matches; every method is a single atomic step.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync + std::fmt::Debug {
    /// Atomically claim `request.key` for the current attempt.
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, LedgerError>;

    /// INFLIGHT → SUCCEEDED. A repeated call on a SUCCEEDED record is a
    /// no-op and leaves the stored result untouched.
    async fn complete(&self, key: &IdempotencyKey, result: JsonValue) -> Result<(), LedgerError>;

    /// INFLIGHT → FAILED. Rejected for SUCCEEDED records.
    async fn fail(&self, key: &IdempotencyKey, error_message: &str) -> Result<(), LedgerError>;

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Remove records whose `expires_at` is at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, LedgerError>;
}
