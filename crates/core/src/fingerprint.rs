//! Payload fingerprints: canonical JSON, idempotency keys and checksums.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters kept for ledger checksums.
const CHECKSUM_LEN: usize = 16;

/// Canonical representation of a JSON payload: object keys sorted, no
/// insignificant whitespace.
///
/// Relies on `serde_json`'s default `BTreeMap`-backed maps, which serialize
/// keys in sorted order at every nesting level.
pub fn canonical_json(payload: &Value) -> String {
    // Serializing a `Value` cannot fail: every key is already a string.
    serde_json::to_string(payload).unwrap_or_default()
}

/// Content-derived idempotency key: full SHA-256 hex digest of the canonical
/// payload.
pub fn idempotency_key_for(payload: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(payload).as_bytes()))
}

/// Integrity hint stored on ledger records.
pub fn checksum(payload: &Value) -> String {
    let mut digest = idempotency_key_for(payload);
    digest.truncate(CHECKSUM_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let a: Value = serde_json::from_str(r#"{"orderId":"o1","amount":50}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "amount": 50, "orderId": "o1" }"#).unwrap();

        assert_eq!(canonical_json(&a), r#"{"amount":50,"orderId":"o1"}"#);
        assert_eq!(idempotency_key_for(&a), idempotency_key_for(&b));
    }

    #[test]
    fn checksum_is_sixteen_hex_chars_prefix_of_key() {
        let payload = json!({"orderId": "o1", "amount": 50});
        let sum = checksum(&payload);

        assert_eq!(sum.len(), 16);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(idempotency_key_for(&payload).starts_with(&sum));
    }

    proptest! {
        #[test]
        fn different_amounts_produce_different_keys(a in 1u32..1_000_000, b in 1u32..1_000_000) {
            prop_assume!(a != b);
            let left = json!({"orderId": "o", "amount": a});
            let right = json!({"orderId": "o", "amount": b});
            prop_assert_ne!(idempotency_key_for(&left), idempotency_key_for(&right));
        }

        #[test]
        fn fingerprint_is_stable_across_reparse(order_id in "[a-z0-9]{1,12}", amount in 1u32..100_000) {
            let payload = json!({"orderId": order_id, "amount": amount});
            let reparsed: Value = serde_json::from_str(&canonical_json(&payload)).unwrap();
            prop_assert_eq!(checksum(&payload), checksum(&reparsed));
        }
    }
}
