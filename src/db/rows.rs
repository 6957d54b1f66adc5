//! Row types and text encodings.
//!
//! Decimals are stored as their canonical string and timestamps as RFC 3339 with
//! as many fractional digits as needed, so a reload yields the identical value.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;

use crate::models::{
    CapitalState, ExecutionStatus, IntentLogEntry, Outcome, Position, PositionStatus, RiskEvent,
    RiskEventKind, TradeKind, TradeRecord, TradeSide,
};

pub(super) fn fmt_decimal(value: &Decimal) -> String {
    value.to_string()
}

pub(super) fn fmt_opt_decimal(value: &Option<Decimal>) -> Option<String> {
    value.as_ref().map(fmt_decimal)
}

pub(super) fn fmt_ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(super) fn fmt_opt_ts(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(fmt_ts)
}

pub(super) fn fmt_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Corrupt decimal in {}: {:?}", field, value))
}

fn parse_opt_decimal(value: Option<&str>, field: &str) -> Result<Option<Decimal>> {
    value.map(|v| parse_decimal(v, field)).transpose()
}

fn parse_ts(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Corrupt timestamp in {}: {:?}", field, value))
}

fn parse_opt_ts(value: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(v, field)).transpose()
}

fn parse_date(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Corrupt date in {}: {:?}", field, value))
}

fn corrupt(field: &str, value: &str) -> anyhow::Error {
    anyhow!("Corrupt value in {}: {:?}", field, value)
}

/// Stored capital state snapshot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct StoredCapital {
    pub capital_base: String,
    pub daily_pnl: String,
    pub total_pnl: String,
    pub day_boundary: String,
    pub killed: bool,
    pub updated_at: String,
}

impl TryFrom<StoredCapital> for CapitalState {
    type Error = anyhow::Error;

    fn try_from(row: StoredCapital) -> Result<Self> {
        Ok(Self {
            capital_base: parse_decimal(&row.capital_base, "capital_state.capital_base")?,
            daily_pnl: parse_decimal(&row.daily_pnl, "capital_state.daily_pnl")?,
            total_pnl: parse_decimal(&row.total_pnl, "capital_state.total_pnl")?,
            day_boundary: parse_date(&row.day_boundary, "capital_state.day_boundary")?,
            killed: row.killed,
            updated_at: parse_ts(&row.updated_at, "capital_state.updated_at")?,
        })
    }
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct StoredPosition {
    pub id: i64,
    pub intent_id: String,
    pub market_id: String,
    pub outcome: String,
    pub side: String,
    pub size: String,
    pub entry_price: String,
    pub opened_at: String,
    pub status: String,
    pub closed_at: Option<String>,
    pub exit_value: Option<String>,
    pub realized_pnl: Option<String>,
}

impl TryFrom<StoredPosition> for Position {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(Self {
            id: row.id,
            outcome: Outcome::parse(&row.outcome)
                .ok_or_else(|| corrupt("positions.outcome", &row.outcome))?,
            side: TradeSide::parse(&row.side).ok_or_else(|| corrupt("positions.side", &row.side))?,
            size: parse_decimal(&row.size, "positions.size")?,
            entry_price: parse_decimal(&row.entry_price, "positions.entry_price")?,
            opened_at: parse_ts(&row.opened_at, "positions.opened_at")?,
            status: PositionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("positions.status", &row.status))?,
            closed_at: parse_opt_ts(row.closed_at.as_deref(), "positions.closed_at")?,
            exit_value: parse_opt_decimal(row.exit_value.as_deref(), "positions.exit_value")?,
            realized_pnl: parse_opt_decimal(row.realized_pnl.as_deref(), "positions.realized_pnl")?,
            intent_id: row.intent_id,
            market_id: row.market_id,
        })
    }
}

/// Stored trade history row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct StoredTrade {
    pub id: String,
    pub intent_id: String,
    pub position_id: Option<i64>,
    pub market_id: String,
    pub kind: String,
    pub status: String,
    pub size: String,
    pub price: Option<String>,
    pub realized_pnl: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

impl TryFrom<StoredTrade> for TradeRecord {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(Self {
            kind: TradeKind::parse(&row.kind).ok_or_else(|| corrupt("trade_history.kind", &row.kind))?,
            status: ExecutionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("trade_history.status", &row.status))?,
            size: parse_decimal(&row.size, "trade_history.size")?,
            price: parse_opt_decimal(row.price.as_deref(), "trade_history.price")?,
            realized_pnl: parse_opt_decimal(row.realized_pnl.as_deref(), "trade_history.realized_pnl")?,
            created_at: parse_ts(&row.created_at, "trade_history.created_at")?,
            resolved_at: parse_opt_ts(row.resolved_at.as_deref(), "trade_history.resolved_at")?,
            id: row.id,
            intent_id: row.intent_id,
            position_id: row.position_id,
            market_id: row.market_id,
            error: row.error,
        })
    }
}

/// Stored intent log row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct StoredIntent {
    pub id: i64,
    pub intent_id: Option<String>,
    pub source_trader: Option<String>,
    pub market_id: Option<String>,
    pub received_at: String,
    pub accepted: bool,
    pub reason: Option<String>,
    pub detail: Option<String>,
    pub payload: String,
}

impl TryFrom<StoredIntent> for IntentLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: StoredIntent) -> Result<Self> {
        Ok(Self {
            received_at: parse_ts(&row.received_at, "intent_log.received_at")?,
            id: row.id,
            intent_id: row.intent_id,
            source_trader: row.source_trader,
            market_id: row.market_id,
            accepted: row.accepted,
            reason: row.reason,
            detail: row.detail,
            payload: row.payload,
        })
    }
}

/// Stored risk event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct StoredRiskEvent {
    pub id: i64,
    pub kind: String,
    pub triggered_at: String,
    pub details: String,
}

impl TryFrom<StoredRiskEvent> for RiskEvent {
    type Error = anyhow::Error;

    fn try_from(row: StoredRiskEvent) -> Result<Self> {
        Ok(Self {
            id: row.id,
            kind: RiskEventKind::parse(&row.kind)
                .ok_or_else(|| corrupt("risk_events.kind", &row.kind))?,
            triggered_at: parse_ts(&row.triggered_at, "risk_events.triggered_at")?,
            details: row.details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timestamp_encoding_keeps_nanos() {
        let ts = Utc::now();
        assert_eq!(parse_ts(&fmt_ts(&ts), "t").unwrap(), ts);
    }

    #[test]
    fn test_decimal_encoding_keeps_scale() {
        let value = dec!(0.5000);
        let back = parse_decimal(&fmt_decimal(&value), "d").unwrap();
        assert_eq!(back.to_string(), "0.5000");
    }

    #[test]
    fn test_corrupt_values_error() {
        assert!(parse_decimal("abc", "d").is_err());
        assert!(parse_date("2026/10/18", "d").is_err());
    }
}
