//! Position model for our own copied holdings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{Outcome, TradeSide};

/// Lifecycle of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// How a position was closed. Both use the same PnL formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Venue resolved the market; value is the final resolution value
    Resolution,
    /// We exited; value is the realized exit price
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Resolution => "resolution",
            CloseReason::Manual => "manual",
        }
    }
}

/// A position opened by an approved and executed intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Store-assigned identifier; 0 until persisted
    pub id: i64,

    /// Intent that opened the position
    pub intent_id: String,

    /// Market condition ID
    pub market_id: String,

    pub outcome: Outcome,

    pub side: TradeSide,

    /// Number of outcome tokens
    pub size: Decimal,

    /// Fill price per token
    pub entry_price: Decimal,

    pub opened_at: DateTime<Utc>,

    pub status: PositionStatus,

    pub closed_at: Option<DateTime<Utc>>,

    /// Settlement value or exit price used at close
    pub exit_value: Option<Decimal>,

    pub realized_pnl: Option<Decimal>,
}

impl Position {
    /// Create an unsaved open position.
    pub fn new(
        intent_id: String,
        market_id: String,
        outcome: Outcome,
        side: TradeSide,
        size: Decimal,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            intent_id,
            market_id,
            outcome,
            side,
            size,
            entry_price,
            opened_at,
            status: PositionStatus::Open,
            closed_at: None,
            exit_value: None,
            realized_pnl: None,
        }
    }

    /// PnL if the position settled at `value` (resolution value or exit price).
    pub fn pnl_at(&self, value: Decimal) -> Decimal {
        self.side.direction() * self.size * (value - self.entry_price)
    }

    /// Cost basis in USDC.
    pub fn cost_basis(&self) -> Decimal {
        self.size * self.entry_price
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Closed copy of this position.
    pub fn closed(&self, value: Decimal, at: DateTime<Utc>) -> Self {
        let mut closed = self.clone();
        closed.status = PositionStatus::Closed;
        closed.closed_at = Some(at);
        closed.exit_value = Some(value);
        closed.realized_pnl = Some(self.pnl_at(value));
        closed
    }
}
