//! In-memory idempotency ledger for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use ingestflow_core::{Clock, IdempotencyKey, SystemClock};

use super::{
    ClaimOutcome, ClaimRequest, DEFAULT_RECORD_TTL_DAYS, IdempotencyLedger, IdempotencyRecord,
    LedgerError, RecordStatus,
};

/// Mutex-guarded map of records.
///
/// Every operation runs under the single lock, which gives the same
/// conditional-write semantics a remote store provides per key. Can be
/// switched offline to exercise the storage-unavailable paths.
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    available: AtomicBool,
}

impl InMemoryLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, Duration::days(DEFAULT_RECORD_TTL_DAYS))
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            ttl,
            available: AtomicBool::new(true),
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Toggle whether the ledger accepts reads and writes.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<IdempotencyKey, IdempotencyRecord>>, LedgerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger switched offline".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger lock poisoned".to_string()))
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, LedgerError> {
        let mut records = self.lock()?;
        let now = self.clock.now();

        match records.get_mut(&request.key) {
            None => {
                let record = IdempotencyRecord {
                    key: request.key.clone(),
                    status: RecordStatus::Inflight,
                    checksum: request.checksum,
                    first_seen_at: now,
                    processed_at: None,
                    failed_at: None,
                    attempts: 1,
                    expires_at: now + self.ttl,
                    request_id: request.request_id,
                    message_id: request.message_id,
                    result: None,
                    error_message: None,
                };
                records.insert(request.key, record);
                Ok(ClaimOutcome::New)
            }
            Some(record) => match record.status {
                RecordStatus::Succeeded => Ok(ClaimOutcome::DuplicateSucceeded(Box::new(record.clone()))),
                RecordStatus::Inflight => Ok(ClaimOutcome::DuplicateInflight),
                RecordStatus::Failed => {
                    record.status = RecordStatus::Inflight;
                    record.attempts += 1;
                    record.request_id = request.request_id;
                    record.message_id = request.message_id;
                    Ok(ClaimOutcome::Retry {
                        attempts: record.attempts,
                    })
                }
            },
        }
    }

    async fn complete(&self, key: &IdempotencyKey, result: JsonValue) -> Result<(), LedgerError> {
        let mut records = self.lock()?;
        let now = self.clock.now();

        let record = records
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        match record.status {
            RecordStatus::Succeeded => Ok(()),
            RecordStatus::Inflight => {
                record.status = RecordStatus::Succeeded;
                record.processed_at = Some(now);
                record.result = Some(result);
                Ok(())
            }
            RecordStatus::Failed => Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: RecordStatus::Failed,
                to: RecordStatus::Succeeded,
            }),
        }
    }

    async fn fail(&self, key: &IdempotencyKey, error_message: &str) -> Result<(), LedgerError> {
        let mut records = self.lock()?;
        let now = self.clock.now();

        let record = records
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        match record.status {
            RecordStatus::Succeeded => Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: RecordStatus::Succeeded,
                to: RecordStatus::Failed,
            }),
            RecordStatus::Inflight | RecordStatus::Failed => {
                record.status = RecordStatus::Failed;
                record.failed_at = Some(now);
                record.error_message = Some(error_message.to_string());
                Ok(())
            }
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, LedgerError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok(before - records.len())
    }
}
