//! Notification publishing/subscription abstraction (mechanics only).
//!
//! The bus carries processing notifications out of the pipeline. It is a
//! best-effort side channel:
//!
//! - **The ledger is the source of truth.** A notification is published only
//!   after the ledger transition it describes has been committed, and a
//!   failed publish never rolls that transition back.
//! - **At-least-once**: a redelivered message whose key already SUCCEEDED
//!   re-emits its success notification; consumers must be idempotent (the
//!   `eventId` is stable per key and outcome).
//! - **No ordering guarantees** between notifications for different keys.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// Failure to hand a message to the bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Internal lock poisoning (in-memory bus).
    #[error("event bus poisoned")]
    Poisoned,

    /// The bus (or the network path to it) is not accepting messages.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// A subscription to the notification stream.
///
/// Each subscription gets a copy of every published message (broadcast
/// semantics) and is meant to be consumed by a single thread.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(envelope) => forward(envelope),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish()` can fail (bus unavailable, lock poisoned). Callers in the
/// pipeline log and swallow the error; see the module docs.
///
/// Implementations must be `Send + Sync`; publishing happens concurrently
/// from every worker task.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
