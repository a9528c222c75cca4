//! Order business logic.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use ingestflow_core::{Clock, Order, OrderResult, round2};

/// Orders above this amount are rejected.
pub const MAX_ORDER_AMOUNT: f64 = 10_000.0;
pub const TAX_RATE: f64 = 0.1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusinessError {
    /// The order violates a business rule.
    #[error("{0}")]
    Rejected(String),

    #[error("Processing error: {0}")]
    Unexpected(String),
}

/// Target of the pipeline: turns a validated order into a result.
#[async_trait]
pub trait OrderProcessor: Send + Sync + std::fmt::Debug {
    async fn process(&self, order: &Order) -> Result<OrderResult, BusinessError>;
}

/// Applies a flat tax and enforces the maximum order amount.
#[derive(Debug)]
pub struct TaxCalculator {
    processed_by: String,
    clock: Arc<dyn Clock>,
}

impl TaxCalculator {
    pub fn new(processed_by: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            processed_by: processed_by.into(),
            clock,
        }
    }
}

#[async_trait]
impl OrderProcessor for TaxCalculator {
    async fn process(&self, order: &Order) -> Result<OrderResult, BusinessError> {
        if order.amount > MAX_ORDER_AMOUNT {
            return Err(BusinessError::Rejected(
                "Amount exceeds maximum limit".to_string(),
            ));
        }

        Ok(OrderResult {
            order_id: order.order_id.clone(),
            processed_amount: order.amount,
            tax: round2(order.amount * TAX_RATE),
            total: round2(order.amount * (1.0 + TAX_RATE)),
            processed_by: self.processed_by.clone(),
            processed_at: self.clock.now(),
        })
    }
}
