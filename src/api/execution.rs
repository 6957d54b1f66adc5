//! Execution boundary: the venue-facing client that fills approved intents.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::TradeIntent;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A completed fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fill {
    pub fill_price: Decimal,
    pub order_id: Option<String>,
}

/// Why execution did not produce a usable fill. Recorded as a failed trade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("execution timed out")]
    Timeout,
    #[error("rejected by venue: {0}")]
    RejectedByVenue(String),
}

impl ExecutionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionError::Network(_) => "network",
            ExecutionError::Timeout => "timeout",
            ExecutionError::RejectedByVenue(_) => "rejected_by_venue",
        }
    }
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit `intent` for `size_usdc` of notional.
    async fn execute(&self, intent: &TradeIntent, size_usdc: Decimal) -> Result<Fill, ExecutionError>;
}

/// Fills every order at its limit price without touching a venue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunClient;

#[async_trait]
impl ExecutionClient for DryRunClient {
    async fn execute(&self, intent: &TradeIntent, size_usdc: Decimal) -> Result<Fill, ExecutionError> {
        info!(
            intent_id = %intent.intent_id,
            market = %intent.market_id,
            side = intent.side.as_str(),
            size_usdc = %size_usdc,
            price = %intent.price_limit,
            "[DRY RUN] Would place order"
        );
        Ok(Fill {
            fill_price: intent.price_limit,
            order_id: Some(format!("dry-run-{}", intent.intent_id)),
        })
    }
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    intent: &'a TradeIntent,
    size_usdc: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    fill_price: Option<Decimal>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error_msg: String,
}

/// Posts intents to a local order-signing sidecar.
pub struct HttpExecutionClient {
    client: Client,
    url: String,
}

impl HttpExecutionClient {
    pub fn new(url: String) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    fn transport_error(e: reqwest::Error) -> ExecutionError {
        if e.is_timeout() {
            ExecutionError::Timeout
        } else {
            ExecutionError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn execute(&self, intent: &TradeIntent, size_usdc: Decimal) -> Result<Fill, ExecutionError> {
        debug!(url = %self.url, intent_id = %intent.intent_id, "Submitting order");

        let response = self
            .client
            .post(&self.url)
            .json(&ExecuteRequest { intent, size_usdc })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::RejectedByVenue(format!("{} - {}", status, body)));
        }

        let body: ExecuteResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout
            } else {
                ExecutionError::RejectedByVenue(format!("unreadable response: {}", e))
            }
        })?;

        if !body.success {
            return Err(ExecutionError::RejectedByVenue(body.error_msg));
        }

        let fill_price = match body.fill_price {
            Some(price) => price,
            None => {
                // The order went through; track it at the limit rather than lose it.
                warn!(intent_id = %intent.intent_id, "Fill without price, recording at limit");
                intent.price_limit
            }
        };

        Ok(Fill {
            fill_price,
            order_id: body.order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawIntent;
    use rust_decimal_macros::dec;

    fn intent() -> TradeIntent {
        RawIntent::from_json(
            r#"{"intent_id":"i-1","timestamp":"2026-10-18T12:00:00Z","source_trader":"0xabc",
                "market_id":"0xm","outcome":"YES","side":"BUY","price_limit":"0.42","size_usdc":"21"}"#,
        )
        .unwrap()
        .into_intent()
        .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_fills_at_limit() {
        let fill = DryRunClient.execute(&intent(), dec!(21)).await.unwrap();
        assert_eq!(fill.fill_price, dec!(0.42));
        assert_eq!(fill.order_id.as_deref(), Some("dry-run-i-1"));
    }

    #[tokio::test]
    async fn test_unreachable_sidecar_is_network_error() {
        let client = HttpExecutionClient::with_timeout(
            "http://127.0.0.1:1/execute".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.execute(&intent(), dec!(21)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Network(_) | ExecutionError::Timeout));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ExecutionError::Timeout.as_str(), "timeout");
        assert_eq!(
            ExecutionError::RejectedByVenue("no liquidity".into()).to_string(),
            "rejected by venue: no liquidity"
        );
    }
}
