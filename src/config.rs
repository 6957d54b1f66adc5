//! Gate configuration: defaults, `COPYGATE_*` environment overrides, validation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::risk::RiskConfig;
use crate::validation::DEFAULT_STALENESS_SECS;

/// Everything the `run` command needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Capital the risk limits are measured against (USDC); seeds a fresh store only
    pub capital_base: Decimal,

    pub risk: RiskConfig,

    /// Maximum intent age before it is rejected as stale
    pub staleness_threshold_secs: u64,

    pub database_url: String,

    /// JSON allowlist file; without one the gate rejects every intent
    pub allowlist_path: Option<PathBuf>,

    pub allowlist_refresh_secs: u64,

    /// Order-signing sidecar; dry-run fills when absent
    pub execution_url: Option<String>,

    pub execution_timeout_secs: u64,

    /// Alert webhook; alerts go to the log when absent
    pub alert_webhook_url: Option<String>,

    /// Local HTTP ingestion endpoint
    pub http_bind: Option<SocketAddr>,

    /// NDJSON intent file to follow
    pub intent_file: Option<PathBuf>,

    /// Poll interval for the intent file (milliseconds)
    pub intent_poll_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capital_base: dec!(1000),           // $1000
            risk: RiskConfig::default(),
            staleness_threshold_secs: DEFAULT_STALENESS_SECS as u64,
            database_url: "sqlite:./copygate.db?mode=rwc".to_string(),
            allowlist_path: None,
            allowlist_refresh_secs: 60,
            execution_url: None,
            execution_timeout_secs: 15,
            alert_webhook_url: None,
            http_bind: None,
            intent_file: None,
            intent_poll_ms: 250,
        }
    }
}

impl GateConfig {
    /// Defaults overridden by `COPYGATE_*` process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `COPYGATE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("COPYGATE_CAPITAL_BASE") {
            config.capital_base = parse(&v, "COPYGATE_CAPITAL_BASE")?;
        }
        if let Some(v) = get("COPYGATE_DAILY_STOP_PCT") {
            config.risk.daily_stop_pct = parse(&v, "COPYGATE_DAILY_STOP_PCT")?;
        }
        if let Some(v) = get("COPYGATE_HARD_KILL_PCT") {
            config.risk.hard_kill_pct = parse(&v, "COPYGATE_HARD_KILL_PCT")?;
        }
        if let Some(v) = get("COPYGATE_MAX_POSITIONS") {
            config.risk.max_positions = parse(&v, "COPYGATE_MAX_POSITIONS")?;
        }
        if let Some(v) = get("COPYGATE_PER_TRADE_CAP_PCT") {
            config.risk.per_trade_cap_pct = parse(&v, "COPYGATE_PER_TRADE_CAP_PCT")?;
        }
        if let Some(v) = get("COPYGATE_ANOMALOUS_LOSS_PCT") {
            config.risk.anomalous_loss_pct = parse(&v, "COPYGATE_ANOMALOUS_LOSS_PCT")?;
        }
        if let Some(v) = get("COPYGATE_STALENESS_SECS") {
            config.staleness_threshold_secs = parse(&v, "COPYGATE_STALENESS_SECS")?;
        }
        if let Some(v) = get("COPYGATE_DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("COPYGATE_ALLOWLIST_PATH") {
            config.allowlist_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("COPYGATE_ALLOWLIST_REFRESH_SECS") {
            config.allowlist_refresh_secs = parse(&v, "COPYGATE_ALLOWLIST_REFRESH_SECS")?;
        }
        if let Some(v) = get("COPYGATE_EXECUTION_URL") {
            config.execution_url = Some(v);
        }
        if let Some(v) = get("COPYGATE_EXECUTION_TIMEOUT_SECS") {
            config.execution_timeout_secs = parse(&v, "COPYGATE_EXECUTION_TIMEOUT_SECS")?;
        }
        if let Some(v) = get("COPYGATE_ALERT_WEBHOOK") {
            config.alert_webhook_url = Some(v);
        }
        if let Some(v) = get("COPYGATE_HTTP_BIND") {
            config.http_bind = Some(parse(&v, "COPYGATE_HTTP_BIND")?);
        }
        if let Some(v) = get("COPYGATE_INTENT_FILE") {
            config.intent_file = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.capital_base > Decimal::ZERO,
            "capital_base must be positive, got {}",
            self.capital_base
        );
        ensure!(self.staleness_threshold_secs > 0, "staleness threshold must be positive");
        ensure!(self.allowlist_refresh_secs > 0, "allowlist refresh interval must be positive");
        ensure!(self.execution_timeout_secs > 0, "execution timeout must be positive");
        self.risk.validate()
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_secs as i64)
    }

    pub fn allowlist_refresh(&self) -> Duration {
        Duration::from_secs(self.allowlist_refresh_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn intent_poll(&self) -> Duration {
        Duration::from_millis(self.intent_poll_ms)
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}: {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk.max_positions, 3);
        assert_eq!(config.staleness_threshold_secs, 10);
    }

    #[test]
    fn test_env_overrides() {
        let config = GateConfig::from_lookup(lookup(&[
            ("COPYGATE_CAPITAL_BASE", "2500.50"),
            ("COPYGATE_MAX_POSITIONS", "5"),
            ("COPYGATE_HTTP_BIND", "127.0.0.1:8787"),
            ("COPYGATE_EXECUTION_URL", ""),
        ]))
        .unwrap();

        assert_eq!(config.capital_base, dec!(2500.50));
        assert_eq!(config.risk.max_positions, 5);
        assert_eq!(config.http_bind, Some("127.0.0.1:8787".parse().unwrap()));
        assert_eq!(config.execution_url, None);
    }

    #[test]
    fn test_unparsable_value_is_error() {
        let err = GateConfig::from_lookup(lookup(&[("COPYGATE_DAILY_STOP_PCT", "five")])).unwrap_err();
        assert!(err.to_string().contains("COPYGATE_DAILY_STOP_PCT"));
    }

    #[test]
    fn test_non_positive_capital_rejected() {
        let config = GateConfig {
            capital_base: dec!(0),
            ..GateConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
