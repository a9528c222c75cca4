//! Dead-letter queue redrive.

pub mod engine;
pub mod filter;

pub use engine::{
    CancelResponse, DlqStats, PreviewFilters, PreviewMessage, PreviewRequest, PreviewResponse,
    RedriveEngine, RedriveError, RedriveStats, StartRequest,
};
pub use filter::{ErrorCategory, MessageFilter, categorize};
