//! Append-only risk events: the audit trail for stops and kills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    DailyStop,
    HardKill,
    AnomalousLoss,
    ManualKill,
}

impl RiskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventKind::DailyStop => "daily_stop",
            RiskEventKind::HardKill => "hard_kill",
            RiskEventKind::AnomalousLoss => "anomalous_loss",
            RiskEventKind::ManualKill => "manual_kill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily_stop" => Some(RiskEventKind::DailyStop),
            "hard_kill" => Some(RiskEventKind::HardKill),
            "anomalous_loss" => Some(RiskEventKind::AnomalousLoss),
            "manual_kill" => Some(RiskEventKind::ManualKill),
            _ => None,
        }
    }

    /// Whether this event sets the kill flag.
    pub fn is_kill(&self) -> bool {
        !matches!(self, RiskEventKind::DailyStop)
    }
}

impl std::fmt::Display for RiskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    /// Store-assigned identifier; 0 until persisted
    pub id: i64,
    pub kind: RiskEventKind,
    pub triggered_at: DateTime<Utc>,
    pub details: String,
}

impl RiskEvent {
    pub fn new(kind: RiskEventKind, triggered_at: DateTime<Utc>, details: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            triggered_at,
            details: details.into(),
        }
    }
}
