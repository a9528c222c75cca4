//! `ingestflow-core`: pipeline foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the order payload schema, payload fingerprints and the clock
//! abstraction used by every time-dependent component.

pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod order;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use fingerprint::{canonical_json, checksum, idempotency_key_for};
pub use id::{IdempotencyKey, MessageId, RequestId};
pub use order::{Order, OrderResult, round2};
