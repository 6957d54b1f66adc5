//! Risk limit configuration.

use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Limits the risk kernel enforces. Percentages are fractions of `capital_base`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Daily realized PnL at or below this halts trading until the next UTC day
    pub daily_stop_pct: Decimal,

    /// Total realized PnL at or below this kills the gate
    pub hard_kill_pct: Decimal,

    /// Maximum open positions (including in-flight executions)
    pub max_positions: usize,

    /// Maximum single trade notional
    pub per_trade_cap_pct: Decimal,

    /// A single realized loss larger than this kills the gate
    pub anomalous_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_stop_pct: dec!(-0.05),    // -5% per UTC day
            hard_kill_pct: dec!(-0.20),     // -20% lifetime
            max_positions: 3,
            per_trade_cap_pct: dec!(0.03),  // 3% per trade
            anomalous_loss_pct: dec!(0.05), // 5% single-trade loss
        }
    }
}

impl RiskConfig {
    /// Reject limit combinations that would make the kernel meaningless.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.daily_stop_pct < Decimal::ZERO,
            "daily_stop_pct must be negative, got {}",
            self.daily_stop_pct
        );
        ensure!(
            self.hard_kill_pct < Decimal::ZERO,
            "hard_kill_pct must be negative, got {}",
            self.hard_kill_pct
        );
        ensure!(
            self.hard_kill_pct <= self.daily_stop_pct,
            "hard_kill_pct ({}) must not be above daily_stop_pct ({})",
            self.hard_kill_pct,
            self.daily_stop_pct
        );
        ensure!(self.max_positions >= 1, "max_positions must be at least 1");
        ensure!(
            self.per_trade_cap_pct > Decimal::ZERO && self.per_trade_cap_pct <= Decimal::ONE,
            "per_trade_cap_pct must be in (0, 1], got {}",
            self.per_trade_cap_pct
        );
        ensure!(
            self.anomalous_loss_pct > Decimal::ZERO && self.anomalous_loss_pct <= Decimal::ONE,
            "anomalous_loss_pct must be in (0, 1], got {}",
            self.anomalous_loss_pct
        );
        Ok(())
    }
}
