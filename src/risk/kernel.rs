//! Risk decision kernel.
//!
//! `decide` walks an ordered list of rules; the first rule that trips rejects the
//! trade. Only when every rule passes is the trade approved. The kernel holds no
//! state: the caller owns the `CapitalState` and persists any transition the
//! kernel asks for (`kill_transition`, `record_trade_settlement`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{CapitalState, RiskEvent, RiskEventKind};

use super::RiskConfig;

/// Why the kernel refused a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRejection {
    Killed,
    HardKill,
    DailyStop,
    PositionLimit,
    PerTradeCap,
}

impl RiskRejection {
    /// Rule precedence, evaluated top-down.
    pub const PRECEDENCE: [RiskRejection; 5] = [
        RiskRejection::Killed,
        RiskRejection::HardKill,
        RiskRejection::DailyStop,
        RiskRejection::PositionLimit,
        RiskRejection::PerTradeCap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskRejection::Killed => "killed",
            RiskRejection::HardKill => "hard_kill",
            RiskRejection::DailyStop => "daily_stop",
            RiskRejection::PositionLimit => "position_limit",
            RiskRejection::PerTradeCap => "per_trade_cap",
        }
    }
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Approve,
    Reject(RiskRejection),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approve)
    }
}

/// Inputs for one decision.
#[derive(Debug, Clone, Copy)]
pub struct RiskInput<'a> {
    pub capital: &'a CapitalState,
    /// Open positions plus in-flight reservations
    pub open_positions: usize,
    /// Proposed trade notional in USDC
    pub trade_size: Decimal,
}

/// Stateless decision function over capital state and a proposed trade.
#[derive(Debug, Clone)]
pub struct RiskKernel {
    config: RiskConfig,
}

impl RiskKernel {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Approve or reject a proposed trade.
    pub fn decide(&self, capital: &CapitalState, open_positions: usize, trade_size: Decimal) -> RiskDecision {
        let input = RiskInput {
            capital,
            open_positions,
            trade_size,
        };

        for rule in RiskRejection::PRECEDENCE {
            if self.rule_trips(rule, &input) {
                debug!(rule = %rule, open = open_positions, size = %trade_size, "Risk rule tripped");
                return RiskDecision::Reject(rule);
            }
        }

        RiskDecision::Approve
    }

    /// Evaluate a single rule in isolation.
    ///
    /// PnL ratios are undefined when `capital_base` is not positive; those rules
    /// then pass through and `PerTradeCap` rejects, since any positive size
    /// exceeds a non-positive cap.
    pub fn rule_trips(&self, rule: RiskRejection, input: &RiskInput<'_>) -> bool {
        let capital = input.capital;
        match rule {
            RiskRejection::Killed => capital.killed,
            RiskRejection::HardKill => capital
                .total_pnl_pct()
                .is_some_and(|pct| pct <= self.config.hard_kill_pct),
            RiskRejection::DailyStop => capital
                .daily_pnl_pct()
                .is_some_and(|pct| pct <= self.config.daily_stop_pct),
            RiskRejection::PositionLimit => input.open_positions >= self.config.max_positions,
            RiskRejection::PerTradeCap => {
                let cap = self.config.per_trade_cap_pct * capital.capital_base;
                input.trade_size <= Decimal::ZERO || input.trade_size > cap
            }
        }
    }

    /// Event to persist alongside a rejection, if the rejection is a stop or kill.
    pub fn event_for(&self, rejection: RiskRejection, capital: &CapitalState, now: DateTime<Utc>) -> Option<RiskEvent> {
        match rejection {
            RiskRejection::HardKill => Some(RiskEvent::new(
                RiskEventKind::HardKill,
                now,
                format!(
                    "total_pnl {} on capital_base {} breached hard_kill_pct {}",
                    capital.total_pnl, capital.capital_base, self.config.hard_kill_pct
                ),
            )),
            RiskRejection::DailyStop => Some(RiskEvent::new(
                RiskEventKind::DailyStop,
                now,
                format!(
                    "daily_pnl {} on capital_base {} breached daily_stop_pct {} for {}",
                    capital.daily_pnl,
                    capital.capital_base,
                    self.config.daily_stop_pct,
                    capital.day_boundary
                ),
            )),
            _ => None,
        }
    }

    /// Kill transition for `capital`. `None` if it is already killed.
    pub fn kill_transition(
        &self,
        capital: &CapitalState,
        kind: RiskEventKind,
        details: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<(CapitalState, RiskEvent)> {
        if capital.killed {
            return None;
        }
        let event = RiskEvent::new(kind, now, details);
        warn!(kind = %kind, details = %event.details, "Kill transition");
        Some((capital.killed_at(now), event))
    }

    /// Post-settlement check: a single loss above `anomalous_loss_pct` of capital
    /// kills regardless of cumulative PnL.
    pub fn record_trade_settlement(
        &self,
        realized_pnl: Decimal,
        capital_base: Decimal,
        now: DateTime<Utc>,
    ) -> Option<RiskEvent> {
        let threshold = self.config.anomalous_loss_pct * capital_base;
        if -realized_pnl > threshold {
            return Some(RiskEvent::new(
                RiskEventKind::AnomalousLoss,
                now,
                format!(
                    "single trade loss {} exceeds {} ({} of capital_base {})",
                    -realized_pnl, threshold, self.config.anomalous_loss_pct, capital_base
                ),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn kernel() -> RiskKernel {
        RiskKernel::new(RiskConfig::default())
    }

    fn capital() -> CapitalState {
        CapitalState::new(dec!(1000), Utc::now())
    }

    #[test]
    fn test_approves_within_limits() {
        assert_eq!(kernel().decide(&capital(), 0, dec!(30)), RiskDecision::Approve);
    }

    #[test]
    fn test_killed_wins_over_everything() {
        let mut state = capital();
        state.killed = true;
        state.total_pnl = dec!(-500);
        assert_eq!(
            kernel().decide(&state, 10, dec!(999)),
            RiskDecision::Reject(RiskRejection::Killed)
        );
    }

    #[test]
    fn test_hard_kill_at_threshold() {
        let mut state = capital();
        state.total_pnl = dec!(-200);
        state.daily_pnl = dec!(-200);
        assert_eq!(
            kernel().decide(&state, 0, dec!(10)),
            RiskDecision::Reject(RiskRejection::HardKill)
        );
    }

    #[test]
    fn test_daily_stop_at_threshold() {
        let mut state = capital();
        state.daily_pnl = dec!(-50);
        state.total_pnl = dec!(-50);
        assert_eq!(
            kernel().decide(&state, 0, dec!(10)),
            RiskDecision::Reject(RiskRejection::DailyStop)
        );

        state.daily_pnl = dec!(-49.99);
        assert_eq!(kernel().decide(&state, 0, dec!(10)), RiskDecision::Approve);
    }

    #[test]
    fn test_position_limit() {
        assert_eq!(
            kernel().decide(&capital(), 3, dec!(10)),
            RiskDecision::Reject(RiskRejection::PositionLimit)
        );
        assert_eq!(kernel().decide(&capital(), 2, dec!(10)), RiskDecision::Approve);
    }

    #[test]
    fn test_per_trade_cap_is_strict() {
        assert_eq!(kernel().decide(&capital(), 0, dec!(30)), RiskDecision::Approve);
        assert_eq!(
            kernel().decide(&capital(), 0, dec!(30.01)),
            RiskDecision::Reject(RiskRejection::PerTradeCap)
        );
    }

    #[test]
    fn test_position_limit_precedes_cap() {
        assert_eq!(
            kernel().decide(&capital(), 3, dec!(500)),
            RiskDecision::Reject(RiskRejection::PositionLimit)
        );
    }

    #[test]
    fn test_non_positive_base_fails_closed() {
        let state = CapitalState::new(Decimal::ZERO, Utc::now());
        assert_eq!(
            kernel().decide(&state, 0, dec!(1)),
            RiskDecision::Reject(RiskRejection::PerTradeCap)
        );
    }

    #[test]
    fn test_each_rule_in_isolation() {
        let k = kernel();
        let clean = capital();
        let input = RiskInput {
            capital: &clean,
            open_positions: 0,
            trade_size: dec!(10),
        };
        for rule in RiskRejection::PRECEDENCE {
            assert!(!k.rule_trips(rule, &input), "{} tripped on clean input", rule);
        }
    }

    #[test]
    fn test_anomalous_loss() {
        let k = kernel();
        let now = Utc::now();
        let event = k.record_trade_settlement(dec!(-60), dec!(1000), now).unwrap();
        assert_eq!(event.kind, RiskEventKind::AnomalousLoss);
        assert!(k.record_trade_settlement(dec!(-50), dec!(1000), now).is_none());
        assert!(k.record_trade_settlement(dec!(400), dec!(1000), now).is_none());
    }

    #[test]
    fn test_kill_transition_is_idempotent() {
        let k = kernel();
        let now = Utc::now();
        let (killed, event) = k
            .kill_transition(&capital(), RiskEventKind::ManualKill, "operator", now)
            .unwrap();
        assert!(killed.killed);
        assert_eq!(event.kind, RiskEventKind::ManualKill);
        assert!(k
            .kill_transition(&killed, RiskEventKind::ManualKill, "again", now)
            .is_none());
    }

    #[test]
    fn test_events_only_for_stops_and_kills() {
        let k = kernel();
        let state = capital();
        let now = Utc::now();
        assert!(k.event_for(RiskRejection::PositionLimit, &state, now).is_none());
        assert!(k.event_for(RiskRejection::Killed, &state, now).is_none());
        assert_eq!(
            k.event_for(RiskRejection::DailyStop, &state, now).unwrap().kind,
            RiskEventKind::DailyStop
        );
    }
}
