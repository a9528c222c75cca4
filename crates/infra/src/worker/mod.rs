//! Queue consumers: per-message processing, order business logic and the
//! background pool that drives them.

pub mod business;
pub mod pool;
pub mod processor;

pub use business::{BusinessError, MAX_ORDER_AMOUNT, OrderProcessor, TaxCalculator};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
pub use processor::{BatchItemFailure, BatchResponse, Disposition, MessageProcessor, NackReason};
