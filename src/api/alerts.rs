//! Alert dispatch. Best-effort: callers log failures and move on.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::RiskEventKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    IntentRejected {
        intent_id: Option<String>,
        reason: String,
    },
    TradeExecuted {
        intent_id: String,
        market_id: String,
        position_id: i64,
        size_usdc: Decimal,
        fill_price: Decimal,
    },
    ExecutionFailed {
        intent_id: String,
        error: String,
    },
    PositionClosed {
        position_id: i64,
        realized_pnl: Decimal,
    },
    KillTriggered {
        kind: RiskEventKind,
        details: String,
    },
}

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        match event {
            AlertEvent::IntentRejected { intent_id, reason } => {
                debug!(intent_id = ?intent_id, reason = %reason, "ALERT intent rejected");
            }
            AlertEvent::TradeExecuted {
                intent_id,
                position_id,
                size_usdc,
                fill_price,
                ..
            } => {
                info!(intent_id = %intent_id, position_id, size = %size_usdc, price = %fill_price, "ALERT trade executed");
            }
            AlertEvent::ExecutionFailed { intent_id, error } => {
                warn!(intent_id = %intent_id, error = %error, "ALERT execution failed");
            }
            AlertEvent::PositionClosed {
                position_id,
                realized_pnl,
            } => {
                info!(position_id, pnl = %realized_pnl, "ALERT position closed");
            }
            AlertEvent::KillTriggered { kind, details } => {
                warn!(kind = %kind, details = %details, "ALERT kill triggered");
            }
        }
        Ok(())
    }
}

/// POSTs alerts as JSON, retrying transient failures for a bounded time.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
    max_elapsed: Duration,
}

impl WebhookDispatcher {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            max_elapsed: Duration::from_secs(30),
        })
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }
}

#[async_trait]
impl AlertDispatcher for WebhookDispatcher {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        backoff::future::retry(policy, || async {
            let response = self
                .client
                .post(&self.url)
                .json(event)
                .send()
                .await
                .map_err(backoff::Error::transient)?;

            match response.error_for_status() {
                Ok(_) => Ok(()),
                Err(e) if e.status().is_some_and(|s| s.is_client_error()) => {
                    Err(backoff::Error::permanent(e))
                }
                Err(e) => Err(backoff::Error::transient(e)),
            }
        })
        .await
        .with_context(|| format!("Alert webhook {} failed", self.url))
    }
}
