//! Capital state: the single mutable record the risk kernel decides against.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current capital, realized PnL and kill flag.
///
/// `killed` only ever moves from `false` to `true` through this type. Clearing it
/// is an administrative action performed directly against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalState {
    /// Capital the percentage limits are measured against (USDC)
    pub capital_base: Decimal,

    /// Realized PnL since `day_boundary` began
    pub daily_pnl: Decimal,

    /// Realized PnL since inception
    pub total_pnl: Decimal,

    /// UTC date `daily_pnl` belongs to
    pub day_boundary: NaiveDate,

    pub killed: bool,

    pub updated_at: DateTime<Utc>,
}

impl CapitalState {
    pub fn new(capital_base: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            capital_base,
            daily_pnl: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            day_boundary: now.date_naive(),
            killed: false,
            updated_at: now,
        }
    }

    /// `daily_pnl / capital_base`, or `None` when the base is not positive.
    pub fn daily_pnl_pct(&self) -> Option<Decimal> {
        self.ratio(self.daily_pnl)
    }

    /// `total_pnl / capital_base`, or `None` when the base is not positive.
    pub fn total_pnl_pct(&self) -> Option<Decimal> {
        self.ratio(self.total_pnl)
    }

    fn ratio(&self, pnl: Decimal) -> Option<Decimal> {
        if self.capital_base <= Decimal::ZERO {
            return None;
        }
        Some(pnl / self.capital_base)
    }

    /// State for `now`'s UTC day. `None` if `now` is not past the current boundary.
    pub fn rolled_to(&self, now: DateTime<Utc>) -> Option<Self> {
        let today = now.date_naive();
        if today <= self.day_boundary {
            return None;
        }
        let mut next = self.clone();
        next.daily_pnl = Decimal::ZERO;
        next.day_boundary = today;
        next.updated_at = now;
        Some(next)
    }

    /// State after a realized settlement.
    pub fn with_realized(&self, pnl: Decimal, now: DateTime<Utc>) -> Self {
        let mut next = self.rolled_to(now).unwrap_or_else(|| self.clone());
        next.daily_pnl += pnl;
        next.total_pnl += pnl;
        next.updated_at = now;
        next
    }

    /// Killed copy of this state.
    pub fn killed_at(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.killed = true;
        next.updated_at = now;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_ratios() {
        let mut state = CapitalState::new(dec!(1000), at(18, 9));
        state.daily_pnl = dec!(-50);
        state.total_pnl = dec!(-200);
        assert_eq!(state.daily_pnl_pct(), Some(dec!(-0.05)));
        assert_eq!(state.total_pnl_pct(), Some(dec!(-0.2)));

        state.capital_base = Decimal::ZERO;
        assert_eq!(state.daily_pnl_pct(), None);
    }

    #[test]
    fn test_day_roll_resets_daily_only() {
        let mut state = CapitalState::new(dec!(1000), at(18, 9));
        state.daily_pnl = dec!(-50);
        state.total_pnl = dec!(-50);

        assert!(state.rolled_to(at(18, 23)).is_none());

        let next = state.rolled_to(at(19, 0)).unwrap();
        assert_eq!(next.daily_pnl, Decimal::ZERO);
        assert_eq!(next.total_pnl, dec!(-50));
        assert_eq!(next.day_boundary, at(19, 0).date_naive());
    }

    #[test]
    fn test_realized_rolls_first() {
        let mut state = CapitalState::new(dec!(1000), at(18, 9));
        state.daily_pnl = dec!(-30);
        state.total_pnl = dec!(-30);

        let next = state.with_realized(dec!(-10), at(19, 1));
        assert_eq!(next.daily_pnl, dec!(-10));
        assert_eq!(next.total_pnl, dec!(-40));
    }

    #[test]
    fn test_killed_is_sticky_on_roll() {
        let state = CapitalState::new(dec!(1000), at(18, 9)).killed_at(at(18, 10));
        assert!(state.rolled_to(at(20, 0)).unwrap().killed);
    }
}
