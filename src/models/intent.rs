//! Trade intents: the untrusted wire form, the validated form, and the intent log row.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::trade::{Outcome, TradeSide};

/// Intent exactly as received from the intent source.
///
/// Every field is optional so that a payload with missing fields still parses and
/// can be logged; `into_intent` decides whether it is complete. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawIntent {
    #[serde(default)]
    pub intent_id: Option<String>,

    /// RFC 3339 string, or unix seconds/milliseconds
    #[serde(default)]
    pub timestamp: Option<Value>,

    #[serde(default)]
    pub source_trader: Option<String>,

    #[serde(default)]
    pub market_id: Option<String>,

    #[serde(default)]
    pub outcome: Option<String>,

    #[serde(default)]
    pub side: Option<String>,

    #[serde(default)]
    pub price_limit: Option<Decimal>,

    #[serde(default)]
    pub size_usdc: Option<Decimal>,

    #[serde(default)]
    pub size_tokens: Option<Decimal>,

    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl RawIntent {
    /// Parse one JSON document.
    pub fn from_json(payload: &str) -> Result<Self, String> {
        serde_json::from_str(payload).map_err(|e| format!("invalid intent json: {}", e))
    }

    /// Best-effort id for logging payloads that failed to parse as a `RawIntent`.
    pub fn sniff_intent_id(payload: &str) -> Option<String> {
        serde_json::from_str::<Value>(payload)
            .ok()?
            .get("intent_id")?
            .as_str()
            .map(str::to_string)
    }

    /// Check schema completeness and convert into a `TradeIntent`.
    pub fn into_intent(self) -> Result<TradeIntent, String> {
        let intent_id = required_str(self.intent_id, "intent_id")?;
        let timestamp = parse_timestamp(self.timestamp.as_ref())?;
        let source_trader = required_str(self.source_trader, "source_trader")?;
        let market_id = required_str(self.market_id, "market_id")?;

        let outcome_raw = required_str(self.outcome, "outcome")?;
        let outcome = Outcome::parse(&outcome_raw)
            .ok_or_else(|| format!("invalid outcome: {}", outcome_raw))?;

        let side_raw = required_str(self.side, "side")?;
        let side =
            TradeSide::parse(&side_raw).ok_or_else(|| format!("invalid side: {}", side_raw))?;

        let price_limit = self.price_limit.ok_or("missing field: price_limit")?;
        if price_limit < MIN_PRICE || price_limit > Decimal::ONE {
            return Err(format!(
                "price_limit out of range [{}, 1]: {}",
                MIN_PRICE, price_limit
            ));
        }

        let size = match (self.size_usdc, self.size_tokens) {
            (Some(usdc), None) => IntentSize::Usdc(usdc),
            (None, Some(tokens)) => IntentSize::Tokens(tokens),
            (Some(_), Some(_)) => {
                return Err("ambiguous size: both size_usdc and size_tokens given".to_string())
            }
            (None, None) => return Err("missing field: size_usdc or size_tokens".to_string()),
        };
        if size.amount() <= Decimal::ZERO {
            return Err(format!("size must be positive: {}", size.amount()));
        }

        Ok(TradeIntent {
            intent_id,
            timestamp,
            source_trader,
            market_id,
            outcome,
            side,
            price_limit,
            size,
            metadata: self.metadata.unwrap_or_default(),
        })
    }
}

fn required_str(value: Option<String>, field: &str) -> Result<String, String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(format!("missing field: {}", field)),
    }
}

/// Smallest price tick a Polymarket order book quotes.
pub const MIN_PRICE: Decimal = dec!(0.0001);

/// Values at or above this are treated as unix milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>, String> {
    match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp {:?}: {}", s, e)),
        Some(Value::Number(n)) => {
            let raw = n
                .as_i64()
                .ok_or_else(|| format!("invalid timestamp: {}", n))?;
            let parsed = if raw >= MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            };
            parsed.ok_or_else(|| format!("timestamp out of range: {}", raw))
        }
        Some(other) => Err(format!("invalid timestamp: {}", other)),
        None => Err("missing field: timestamp".to_string()),
    }
}

/// Requested trade size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentSize {
    #[serde(rename = "size_usdc")]
    Usdc(Decimal),
    #[serde(rename = "size_tokens")]
    Tokens(Decimal),
}

impl IntentSize {
    pub fn amount(&self) -> Decimal {
        match self {
            IntentSize::Usdc(v) | IntentSize::Tokens(v) => *v,
        }
    }
}

/// A schema-complete trade intent. Never mutated after validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeIntent {
    pub intent_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_trader: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub price_limit: Decimal,
    #[serde(flatten)]
    pub size: IntentSize,
    pub metadata: Map<String, Value>,
}

impl TradeIntent {
    /// Capital committed by this trade in USDC.
    pub fn notional_usdc(&self) -> Decimal {
        match self.size {
            IntentSize::Usdc(usdc) => usdc,
            IntentSize::Tokens(tokens) => tokens * self.price_limit,
        }
    }

    /// Token quantity obtained by a fill at `fill_price`.
    ///
    /// Errors when the fill is outside (0, 1], on the wrong side of
    /// `price_limit` (above it for a BUY, below it for a SELL), or yields a
    /// quantity that does not fit in a `Decimal`.
    pub fn tokens_at(&self, fill_price: Decimal) -> Result<Decimal, String> {
        if fill_price <= Decimal::ZERO || fill_price > Decimal::ONE {
            return Err(format!("fill price out of range (0, 1]: {}", fill_price));
        }
        let within_limit = match self.side {
            TradeSide::Buy => fill_price <= self.price_limit,
            TradeSide::Sell => fill_price >= self.price_limit,
        };
        if !within_limit {
            return Err(format!(
                "{} fill at {} breaches price limit {}",
                self.side.as_str(),
                fill_price,
                self.price_limit
            ));
        }
        match self.size {
            IntentSize::Tokens(tokens) => Ok(tokens),
            IntentSize::Usdc(usdc) => usdc
                .checked_div(fill_price)
                .ok_or_else(|| format!("token quantity overflows: {} / {}", usdc, fill_price)),
        }
    }

    /// Market category carried in metadata, if the source supplied one.
    pub fn category(&self) -> Option<&str> {
        self.metadata.get("category").and_then(Value::as_str)
    }

    /// Age of the intent relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Intent log row: every intent seen, accepted or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentLogEntry {
    pub id: i64,
    pub intent_id: Option<String>,
    pub source_trader: Option<String>,
    pub market_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub accepted: bool,
    /// Rejection reason code (`stale`, `daily_stop`, ...)
    pub reason: Option<String>,
    /// Human-readable detail, e.g. the missing field of a malformed intent
    pub detail: Option<String>,
    /// Payload as received
    pub payload: String,
}
