//! Per-dependency circuit breakers.
//!
//! ```text
//!   CLOSED ──(failures ≥ threshold)──▶ OPEN
//!     ▲                                  │ recovery timeout elapsed
//!     │ trial ok                         ▼
//!     └──────────────────────────── HALF_OPEN ──(trial fails)──▶ OPEN
//! ```
//!
//! HALF_OPEN admits exactly one trial call; everyone else is rejected until
//! the trial reports back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use ingestflow_core::Clock;

pub const LEDGER_STORE: &str = "ledger-store";
pub const QUEUE: &str = "queue";
pub const EVENT_BUS: &str = "event-bus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    pub const fn new(failure_threshold: u32, recovery_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_timeout_secs),
        }
    }

    /// Defaults per dependency name.
    pub fn for_dependency(name: &str) -> Self {
        match name {
            LEDGER_STORE => Self::new(3, 30),
            QUEUE => Self::new(5, 60),
            EVENT_BUS => Self::new(3, 45),
            _ => Self::new(5, 60),
        }
    }
}

/// Call rejected without reaching the dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker {dependency} is open")]
pub struct BreakerError {
    pub dependency: String,
}

/// Either the breaker rejected the call or the call itself failed.
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    #[error(transparent)]
    Open(#[from] BreakerError),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Ask permission for one call. Every `Ok` must be followed by exactly
    /// one `on_success` or `on_failure`.
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejected())
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let recovered = inner.last_failure_at.is_none_or(|at| {
                    let elapsed = self.clock.now().signed_duration_since(at);
                    elapsed.to_std().unwrap_or(Duration::ZERO) >= self.config.recovery_timeout
                });
                if recovered {
                    info!(breaker = %self.name, "recovery timeout elapsed; admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(self.rejected())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "trial call succeeded; closing breaker");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        let now = self.clock.now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "trial call failed; reopening breaker");
                inner.state = BreakerState::Open;
                inner.trial_in_flight = false;
            }
            BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached; opening breaker"
                );
                inner.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Run `op` under the breaker. `counts_as_failure` decides which errors
    /// trip it; other errors are treated as a healthy dependency.
    pub async fn call<T, E, Fut>(
        &self,
        op: impl FnOnce() -> Fut,
        counts_as_failure: impl Fn(&E) -> bool,
    ) -> Result<T, GuardedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.on_failure();
                } else {
                    self.on_success();
                }
                Err(GuardedError::Inner(e))
            }
        }
    }

    fn rejected(&self) -> BreakerError {
        BreakerError {
            dependency: self.name.clone(),
        }
    }
}

/// Named breakers, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, BreakerConfig::for_dependency(name))
    }

    /// Like [`get`](Self::get); `config` applies only if the breaker does
    /// not exist yet.
    pub fn get_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config, self.clock.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
