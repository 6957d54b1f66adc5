//! Position tracker.
//!
//! Owns the current `CapitalState` and the open positions. Every mutation is
//! written to the store first and only then applied in memory, so a failed
//! write leaves the in-memory view equal to what is persisted.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::db::{CloseCommit, Database, DecisionRecord, ExecutionCommit};
use crate::models::{
    CapitalState, CloseReason, Position, RiskEvent, RiskEventKind, TradeRecord,
};
use crate::risk::RiskKernel;

/// Result of closing a position.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub realized_pnl: Decimal,
    /// Anomalous-loss event raised by this close, if any
    pub risk_event: Option<RiskEvent>,
}

pub struct PositionTracker {
    db: Database,
    kernel: RiskKernel,
    capital: CapitalState,
    open: BTreeMap<i64, Position>,
    /// UTC day a daily-stop event was last recorded for
    daily_stop_noted: Option<NaiveDate>,
}

impl PositionTracker {
    /// Rebuild the tracker from the store, seeding capital on a fresh store.
    ///
    /// A stored `capital_base` wins over `capital_base`; a mismatch is only logged.
    pub async fn load(
        db: Database,
        kernel: RiskKernel,
        capital_base: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let capital = match db.load_capital_state().await? {
            Some(stored) => {
                if stored.capital_base != capital_base {
                    warn!(
                        stored = %stored.capital_base,
                        configured = %capital_base,
                        "Configured capital_base differs from stored state; using stored value"
                    );
                }
                stored
            }
            None => {
                let fresh = CapitalState::new(capital_base, now);
                db.init_capital_state(&fresh).await?;
                info!(capital_base = %capital_base, "Seeded capital state");
                fresh
            }
        };

        let open: BTreeMap<i64, Position> = db
            .load_open_positions()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let daily_stop_noted = db
            .recent_risk_events(50)
            .await?
            .into_iter()
            .filter(|e| e.kind == RiskEventKind::DailyStop)
            .map(|e| e.triggered_at.date_naive())
            .max();

        if capital.killed {
            warn!("Loaded killed capital state; all intents will be rejected");
        }
        info!(
            open = open.len(),
            daily_pnl = %capital.daily_pnl,
            total_pnl = %capital.total_pnl,
            "Position tracker loaded"
        );

        Ok(Self {
            db,
            kernel,
            capital,
            open,
            daily_stop_noted,
        })
    }

    pub fn kernel(&self) -> &RiskKernel {
        &self.kernel
    }

    pub fn capital(&self) -> &CapitalState {
        &self.capital
    }

    /// Capital state as of `now`, with the daily PnL reset if the UTC day moved on.
    /// Nothing is persisted.
    pub fn capital_at(&self, now: DateTime<Utc>) -> CapitalState {
        self.capital
            .rolled_to(now)
            .unwrap_or_else(|| self.capital.clone())
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.capital.daily_pnl
    }

    pub fn total_pnl(&self) -> Decimal {
        self.capital.total_pnl
    }

    pub fn is_killed(&self) -> bool {
        self.capital.killed
    }

    pub fn position(&self, id: i64) -> Option<&Position> {
        self.open.get(&id)
    }

    /// Open positions, oldest first.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.open.values()
    }

    pub async fn intent_seen(&self, intent_id: &str) -> Result<bool> {
        self.db.intent_seen(intent_id).await
    }

    /// Whether a daily-stop event is already on record for `day`.
    pub fn daily_stop_noted(&self, day: NaiveDate) -> bool {
        self.daily_stop_noted == Some(day)
    }

    /// Persist an intent decision and adopt its capital snapshot, if any.
    pub async fn record_decision(&mut self, record: DecisionRecord) -> Result<i64> {
        if let Some(next) = &record.capital {
            if self.capital.killed && !next.killed {
                bail!("Refusing to persist a capital state that clears the kill flag");
            }
        }

        let id = self.db.apply_decision(&record).await?;

        if let Some(event) = &record.risk_event {
            if event.kind == RiskEventKind::DailyStop {
                self.daily_stop_noted = Some(event.triggered_at.date_naive());
            }
        }
        if let Some(next) = record.capital {
            self.capital = next;
        }
        Ok(id)
    }

    /// Record a filled entry. Returns the position with its store id.
    pub async fn open(&mut self, position: Position, trade: TradeRecord) -> Result<Position> {
        let id = self
            .db
            .commit_execution(&ExecutionCommit {
                trade,
                position: Some(position.clone()),
            })
            .await?
            .context("Store did not return a position id")?;

        let position = Position { id, ..position };
        info!(
            position_id = id,
            market = %position.market_id,
            side = %position.side.as_str(),
            size = %position.size,
            entry = %position.entry_price,
            "Position opened"
        );
        self.open.insert(id, position.clone());
        Ok(position)
    }

    /// Record a failed execution. Capital is untouched.
    pub async fn record_failed(&mut self, trade: TradeRecord) -> Result<()> {
        self.db
            .commit_execution(&ExecutionCommit {
                trade,
                position: None,
            })
            .await?;
        Ok(())
    }

    /// Close an open position at `value` and run the anomalous-loss check.
    ///
    /// `value` is the resolution value or the exit price, per token.
    pub async fn close(
        &mut self,
        position_id: i64,
        value: Decimal,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition> {
        let Some(position) = self.open.get(&position_id) else {
            bail!("Position {} is not open", position_id);
        };
        if value < Decimal::ZERO || value > Decimal::ONE {
            bail!("Close value {} outside [0, 1]", value);
        }

        let closed = position.closed(value, now);
        let realized_pnl = position.pnl_at(value);

        let mut capital = self.capital.with_realized(realized_pnl, now);
        let risk_event = self
            .kernel
            .record_trade_settlement(realized_pnl, self.capital.capital_base, now);
        if risk_event.is_some() && !capital.killed {
            capital = capital.killed_at(now);
        }

        let trade = TradeRecord::settlement(
            &position.intent_id,
            position_id,
            &position.market_id,
            position.size,
            value,
            realized_pnl,
            now,
        );

        self.db
            .commit_close(&CloseCommit {
                position: closed.clone(),
                trade,
                capital: capital.clone(),
                risk_event: risk_event.clone(),
            })
            .await?;

        self.open.remove(&position_id);
        self.capital = capital;

        info!(
            position_id,
            reason = reason.as_str(),
            value = %value,
            pnl = %realized_pnl,
            daily_pnl = %self.capital.daily_pnl,
            total_pnl = %self.capital.total_pnl,
            "Position closed"
        );
        if let Some(event) = &risk_event {
            warn!(details = %event.details, "Anomalous loss, trading killed");
        }

        Ok(ClosedPosition {
            position: closed,
            realized_pnl,
            risk_event,
        })
    }

    /// Manual kill. Returns the persisted event, or `None` if already killed.
    pub async fn kill(
        &mut self,
        kind: RiskEventKind,
        details: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RiskEvent>> {
        let Some((capital, event)) = self.kernel.kill_transition(&self.capital, kind, details, now)
        else {
            info!("Kill requested but already killed");
            return Ok(None);
        };

        let id = self.db.record_kill(&event, &capital).await?;
        self.capital = capital;
        Ok(Some(RiskEvent { id, ..event }))
    }
}
