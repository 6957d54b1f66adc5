//! Data models for intents, positions, trades, capital state and risk events.

mod capital;
mod intent;
mod position;
mod risk_event;
mod trade;

pub use capital::CapitalState;
pub use intent::{IntentLogEntry, IntentSize, RawIntent, TradeIntent};
pub use position::{CloseReason, Position, PositionStatus};
pub use risk_event::{RiskEvent, RiskEventKind};
pub use trade::{ExecutionStatus, Outcome, TradeKind, TradeRecord, TradeSide};
