//! Trust-boundary validation of incoming intents.
//!
//! Checks run in a fixed order and the first failure wins:
//! schema completeness, staleness, duplicate id, allowlist membership.
//! Schema and staleness need no shared state (`precheck`); the duplicate and
//! allowlist checks run against the store and the latest snapshot (`admit`).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::allowlist::{AllowlistSnapshot, Membership};
use crate::models::{RawIntent, TradeIntent};

/// Default maximum intent age.
pub const DEFAULT_STALENESS_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRejection {
    Malformed,
    Stale,
    Duplicate,
    AllowlistEmpty,
    NotAllowlisted,
}

impl ValidationRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRejection::Malformed => "malformed",
            ValidationRejection::Stale => "stale",
            ValidationRejection::Duplicate => "duplicate",
            ValidationRejection::AllowlistEmpty => "allowlist_empty",
            ValidationRejection::NotAllowlisted => "not_allowlisted",
        }
    }
}

impl std::fmt::Display for ValidationRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejection with a human-readable detail for the intent log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub reason: ValidationRejection,
    pub detail: String,
}

impl Rejected {
    fn new(reason: ValidationRejection, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accept(TradeIntent),
    Reject(Rejected),
}

#[derive(Debug, Clone)]
pub struct IntentValidator {
    staleness_threshold: Duration,
}

impl Default for IntentValidator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_STALENESS_SECS))
    }
}

impl IntentValidator {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Run every check in order. `seen` answers whether an intent id was already
    /// recorded.
    pub fn validate(
        &self,
        raw: RawIntent,
        allowlist: &AllowlistSnapshot,
        now: DateTime<Utc>,
        seen: impl FnOnce(&str) -> bool,
    ) -> Validation {
        match self.precheck(raw, now) {
            Validation::Accept(intent) => {
                let already_seen = seen(&intent.intent_id);
                match self.admit(&intent, allowlist, already_seen) {
                    Some(rejected) => Validation::Reject(rejected),
                    None => Validation::Accept(intent),
                }
            }
            rejected => rejected,
        }
    }

    /// Schema completeness and staleness.
    pub fn precheck(&self, raw: RawIntent, now: DateTime<Utc>) -> Validation {
        let intent = match raw.into_intent() {
            Ok(intent) => intent,
            Err(detail) => {
                return Validation::Reject(Rejected::new(ValidationRejection::Malformed, detail))
            }
        };

        let age = intent.age(now);
        if age > self.staleness_threshold {
            debug!(intent_id = %intent.intent_id, age_ms = age.num_milliseconds(), "Stale intent");
            return Validation::Reject(Rejected::new(
                ValidationRejection::Stale,
                format!(
                    "age {}ms exceeds {}ms",
                    age.num_milliseconds(),
                    self.staleness_threshold.num_milliseconds()
                ),
            ));
        }

        Validation::Accept(intent)
    }

    /// Duplicate id and allowlist membership. `None` means admitted.
    pub fn admit(
        &self,
        intent: &TradeIntent,
        allowlist: &AllowlistSnapshot,
        already_seen: bool,
    ) -> Option<Rejected> {
        if already_seen {
            return Some(Rejected::new(
                ValidationRejection::Duplicate,
                format!("intent_id {} already seen", intent.intent_id),
            ));
        }

        match allowlist.lookup(&intent.market_id, intent.category()) {
            Membership::Allowed => None,
            Membership::Empty => Some(Rejected::new(
                ValidationRejection::AllowlistEmpty,
                "allowlist snapshot is empty",
            )),
            Membership::NotListed => Some(Rejected::new(
                ValidationRejection::NotAllowlisted,
                format!("market {} not in allowlist", intent.market_id),
            )),
        }
    }
}
