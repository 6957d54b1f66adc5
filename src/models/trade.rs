//! Trade direction, outcome side, and the append-only trade history record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Case-insensitive parse of the wire value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    /// Sign applied to price moves when computing PnL.
    pub fn direction(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Binary market outcome token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(Outcome::Yes),
            "NO" => Some(Outcome::No),
            _ => None,
        }
    }
}

/// Whether the execution client filled the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Executed => "executed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executed" => Some(ExecutionStatus::Executed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// What a trade history row records: the entry fill or the settlement of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Entry,
    Close,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Entry => "entry",
            TradeKind::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(TradeKind::Entry),
            "close" => Some(TradeKind::Close),
            _ => None,
        }
    }
}

/// Append-only trade history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Record identifier (UUID v4)
    pub id: String,

    /// Intent that caused the trade
    pub intent_id: String,

    /// Position opened or closed by this trade, if any
    pub position_id: Option<i64>,

    pub market_id: String,

    pub kind: TradeKind,

    pub status: ExecutionStatus,

    /// Notional in USDC for entries, token size for closes
    pub size: Decimal,

    /// Fill price for entries, settlement value for closes
    pub price: Option<Decimal>,

    /// Realized PnL; `None` until the position is resolved
    pub realized_pnl: Option<Decimal>,

    /// Execution error description for failed entries
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,
}

impl TradeRecord {
    /// Entry fill for an approved intent.
    pub fn executed(
        intent_id: &str,
        position_id: i64,
        market_id: &str,
        size_usdc: Decimal,
        fill_price: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent_id.to_string(),
            position_id: Some(position_id),
            market_id: market_id.to_string(),
            kind: TradeKind::Entry,
            status: ExecutionStatus::Executed,
            size: size_usdc,
            price: Some(fill_price),
            realized_pnl: None,
            error: None,
            created_at: at,
            resolved_at: None,
        }
    }

    /// Failed execution; no position exists.
    pub fn failed(
        intent_id: &str,
        market_id: &str,
        size_usdc: Decimal,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent_id.to_string(),
            position_id: None,
            market_id: market_id.to_string(),
            kind: TradeKind::Entry,
            status: ExecutionStatus::Failed,
            size: size_usdc,
            price: None,
            realized_pnl: None,
            error: Some(error.into()),
            created_at: at,
            resolved_at: None,
        }
    }

    /// Settlement of a closed position.
    pub fn settlement(
        intent_id: &str,
        position_id: i64,
        market_id: &str,
        size_tokens: Decimal,
        settlement_value: Decimal,
        realized_pnl: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent_id.to_string(),
            position_id: Some(position_id),
            market_id: market_id.to_string(),
            kind: TradeKind::Close,
            status: ExecutionStatus::Executed,
            size: size_tokens,
            price: Some(settlement_value),
            realized_pnl: Some(realized_pnl),
            error: None,
            created_at: at,
            resolved_at: Some(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parse_is_case_insensitive() {
        assert_eq!(TradeSide::parse("buy"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse(" SELL "), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
        assert_eq!(Outcome::parse("yes"), Some(Outcome::Yes));
        assert_eq!(Outcome::parse("maybe"), None);
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(TradeSide::Buy.direction(), dec!(1));
        assert_eq!(TradeSide::Sell.direction(), dec!(-1));
    }

    #[test]
    fn test_failed_record_has_no_position() {
        let record = TradeRecord::failed("i-1", "0xabc", dec!(25), "timeout", Utc::now());
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.position_id.is_none());
        assert!(record.realized_pnl.is_none());
        assert_eq!(record.error.as_deref(), Some("timeout"));
    }
}
