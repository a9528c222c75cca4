//! Failure containment around external dependencies: circuit breakers and
//! retry backoff.

pub mod backoff;
pub mod breaker;

pub use backoff::{RetryPolicy, backoff_delay, redrive_delay, retry_with_backoff, spread_jitter};
pub use breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
    EVENT_BUS, GuardedError, LEDGER_STORE, QUEUE,
};
