//! Typed order schema.
//!
//! Payloads arrive as free-form JSON. They are validated once, at ingress,
//! into an [`Order`]; everything downstream works on the typed struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

const REQUIRED_FIELDS: [&str; 2] = ["orderId", "amount"];

/// A validated order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub amount: f64,
}

impl Order {
    /// Validate a raw payload.
    ///
    /// `amount` may be a JSON number or a numeric string; it must be finite
    /// and strictly positive.
    pub fn from_payload(payload: &Value) -> DomainResult<Self> {
        let fields = payload
            .as_object()
            .ok_or_else(|| DomainError::validation("payload must be a JSON object"))?;

        for field in REQUIRED_FIELDS {
            if !fields.contains_key(field) {
                return Err(DomainError::validation(format!(
                    "Missing required field: {field}"
                )));
            }
        }

        let order_id = match fields.get("orderId") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => return Err(DomainError::validation("orderId must be a non-empty string")),
        };

        let amount = match fields.get("amount") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|a| a.is_finite())
        .ok_or_else(|| DomainError::validation("amount must be a valid number"))?;

        if amount <= 0.0 {
            return Err(DomainError::validation("amount must be a positive number"));
        }

        Ok(Self { order_id, amount })
    }
}

/// Output of the order business logic, stored on the ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub order_id: String,
    pub processed_amount: f64,
    pub tax: f64,
    pub total: f64,
    pub processed_by: String,
    pub processed_at: DateTime<Utc>,
}

/// Round half away from zero to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn reason(payload: Value) -> String {
        Order::from_payload(&payload).unwrap_err().message().to_string()
    }

    #[test]
    fn accepts_valid_order() {
        let order = Order::from_payload(&json!({"orderId": "o1", "amount": 50})).unwrap();
        assert_eq!(order.order_id, "o1");
        assert_eq!(order.amount, 50.0);
    }

    #[test]
    fn accepts_numeric_string_amount() {
        let order = Order::from_payload(&json!({"orderId": "o1", "amount": "12.5"})).unwrap();
        assert_eq!(order.amount, 12.5);
    }

    #[test]
    fn reports_first_missing_field() {
        assert_eq!(reason(json!({"amount": 5})), "Missing required field: orderId");
        assert_eq!(reason(json!({"orderId": "o1"})), "Missing required field: amount");
    }

    #[test]
    fn rejects_blank_or_non_string_order_id() {
        assert_eq!(
            reason(json!({"orderId": "  ", "amount": 5})),
            "orderId must be a non-empty string"
        );
        assert_eq!(
            reason(json!({"orderId": 7, "amount": 5})),
            "orderId must be a non-empty string"
        );
    }

    #[test]
    fn rejects_bad_amounts() {
        assert_eq!(
            reason(json!({"orderId": "o1", "amount": "abc"})),
            "amount must be a valid number"
        );
        assert_eq!(
            reason(json!({"orderId": "o1", "amount": null})),
            "amount must be a valid number"
        );
        assert_eq!(
            reason(json!({"orderId": "o1", "amount": 0})),
            "amount must be a positive number"
        );
        assert_eq!(
            reason(json!({"orderId": "o1", "amount": -3.2})),
            "amount must be a positive number"
        );
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(Order::from_payload(&json!(["orderId", "amount"])).is_err());
    }

    #[test]
    fn round2_matches_currency_rounding() {
        assert_eq!(round2(50.0 * 1.1), 55.0);
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(19.994), 19.99);
    }

    proptest! {
        #[test]
        fn any_positive_amount_validates(cents in 1u64..10_000_000) {
            let amount = cents as f64 / 100.0;
            let order = Order::from_payload(&json!({"orderId": "o", "amount": amount})).unwrap();
            prop_assert_eq!(order.amount, amount);
        }
    }
}
