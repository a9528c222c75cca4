//! Fault injection harness.
//!
//! Decisions are a pure function of the failure mode and the message id, so
//! every redelivery of the same message makes the same choice.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use ingestflow_core::MessageId;

/// Percentage of ids failed by [`FailureMode::RandomFailP30`].
pub const RANDOM_FAIL_PERCENT: u32 = 30;

/// Configured failure mode.
///
/// Parsing never fails: unrecognised strings are kept verbatim and behave
/// like `none`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureMode {
    #[default]
    None,
    PoisonPayload,
    SlowDownstream,
    RandomFailP30,
    Unknown(String),
}

impl FailureMode {
    pub fn as_str(&self) -> &str {
        match self {
            FailureMode::None => "none",
            FailureMode::PoisonPayload => "poison_payload",
            FailureMode::SlowDownstream => "slow_downstream",
            FailureMode::RandomFailP30 => "random_fail_p30",
            FailureMode::Unknown(raw) => raw,
        }
    }
}

impl FromStr for FailureMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "none" => FailureMode::None,
            "poison_payload" => FailureMode::PoisonPayload,
            "slow_downstream" => FailureMode::SlowDownstream,
            "random_fail_p30" => FailureMode::RandomFailP30,
            other => FailureMode::Unknown(other.to_string()),
        })
    }
}

impl From<String> for FailureMode {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<FailureMode> for String {
    fn from(value: FailureMode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    SchemaValidationError,
    TimeoutError,
    TransientError,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::SchemaValidationError => "SchemaValidationError",
            FaultKind::TimeoutError => "TimeoutError",
            FaultKind::TransientError => "TransientError",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic bucket in `0..100` for a seed string.
pub fn bucket(seed: &str) -> u32 {
    let digest = Sha256::digest(seed.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % 100
}

/// Decide whether to inject a fault for this message.
pub fn decide(mode: &FailureMode, message_id: &MessageId) -> Option<FaultKind> {
    decide_for_seed(mode, &message_id.to_string())
}

/// Same decision keyed by an arbitrary string (ingest keys it by request id,
/// before a message id exists).
pub fn decide_for_seed(mode: &FailureMode, seed: &str) -> Option<FaultKind> {
    match mode {
        FailureMode::PoisonPayload => Some(FaultKind::SchemaValidationError),
        FailureMode::SlowDownstream => Some(FaultKind::TimeoutError),
        FailureMode::RandomFailP30 if bucket(seed) < RANDOM_FAIL_PERCENT => {
            Some(FaultKind::TransientError)
        }
        _ => None,
    }
}

/// Holds the live failure mode; switchable at runtime.
#[derive(Debug, Default)]
pub struct FaultInjector {
    mode: RwLock<FailureMode>,
}

impl FaultInjector {
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> FailureMode {
        self.mode.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_mode(&self, mode: FailureMode) {
        info!(failure_mode = %mode, "failure mode changed");
        *self.mode.write().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    pub fn decide(&self, message_id: &MessageId) -> Option<FaultKind> {
        decide(&self.mode(), message_id)
    }

    pub fn decide_for_seed(&self, seed: &str) -> Option<FaultKind> {
        decide_for_seed(&self.mode(), seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn parses_known_modes_and_keeps_unknown_ones() {
        assert_eq!("none".parse::<FailureMode>().unwrap(), FailureMode::None);
        assert_eq!(
            "random_fail_p30".parse::<FailureMode>().unwrap(),
            FailureMode::RandomFailP30
        );
        let odd: FailureMode = "chaos_monkey".parse().unwrap();
        assert_eq!(odd, FailureMode::Unknown("chaos_monkey".to_string()));
        assert_eq!(odd.to_string(), "chaos_monkey");
        assert_eq!(decide(&odd, &MessageId::new()), None);
    }

    #[test]
    fn fixed_modes_always_fault() {
        let id = MessageId::new();
        assert_eq!(decide(&FailureMode::None, &id), None);
        assert_eq!(
            decide(&FailureMode::PoisonPayload, &id),
            Some(FaultKind::SchemaValidationError)
        );
        assert_eq!(
            decide(&FailureMode::SlowDownstream, &id),
            Some(FaultKind::TimeoutError)
        );
    }

    #[test]
    fn random_mode_fails_roughly_thirty_percent() {
        let failures = (0u128..10_000)
            .map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
            .filter(|id| decide(&FailureMode::RandomFailP30, id).is_some())
            .count();

        assert!((2_600..=3_400).contains(&failures), "got {failures}");
    }

    #[test]
    fn injector_switches_mode_at_runtime() {
        let injector = FaultInjector::default();
        let id = MessageId::new();
        assert_eq!(injector.decide(&id), None);

        injector.set_mode(FailureMode::SlowDownstream);
        assert_eq!(injector.decide(&id), Some(FaultKind::TimeoutError));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&FailureMode::PoisonPayload).unwrap();
        assert_eq!(json, "\"poison_payload\"");
        let back: FailureMode = serde_json::from_str("\"slow_downstream\"").unwrap();
        assert_eq!(back, FailureMode::SlowDownstream);
    }

    proptest! {
        #[test]
        fn random_mode_is_deterministic_per_id(n in any::<u128>()) {
            let id = MessageId::from_uuid(Uuid::from_u128(n));
            prop_assert_eq!(
                decide(&FailureMode::RandomFailP30, &id),
                decide(&FailureMode::RandomFailP30, &id)
            );
            prop_assert!(bucket(&id.to_string()) < 100);
        }
    }
}
