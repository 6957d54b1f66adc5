//! Executor: the single serialization boundary for intents.
//!
//! Flow for one intent:
//! 1. Schema and staleness checks, outside the lock
//! 2. Under the lock: duplicate and allowlist checks, risk decision, decision
//!    persisted, capital reserved
//! 3. Execution call, outside the lock
//! 4. Under the lock again: fill or failure committed, reservation released
//! 5. Alert spawned, best-effort
//!
//! Any storage failure halts the executor until restart.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allowlist::AllowlistHandle;
use crate::api::{AlertDispatcher, AlertEvent, ExecutionClient, ExecutionError};
use crate::clock::{Clock, SystemClock};
use crate::db::DecisionRecord;
use crate::models::{
    CapitalState, CloseReason, IntentLogEntry, Position, RawIntent, RiskEvent, RiskEventKind,
    TradeRecord,
};
use crate::risk::{RiskDecision, RiskRejection};
use crate::tracker::{ClosedPosition, PositionTracker};
use crate::validation::{IntentValidator, Rejected, Validation, ValidationRejection};

/// Returned by every call after a storage failure.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("executor halted after a storage failure; restart to reload state")]
pub struct ExecutorHalted;

/// Reason an intent was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RejectReason {
    Validation(ValidationRejection),
    Risk(RiskRejection),
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Validation(r) => r.as_str(),
            RejectReason::Risk(r) => r.as_str(),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of ingesting one intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Rejected {
        intent_id: Option<String>,
        reason: RejectReason,
        detail: Option<String>,
    },
    Executed {
        intent_id: String,
        position_id: i64,
        size_usdc: Decimal,
        fill_price: Decimal,
    },
    ExecutionFailed {
        intent_id: String,
        error: ExecutionError,
    },
}

impl IngestOutcome {
    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            IngestOutcome::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, IngestOutcome::Executed { .. })
    }

    pub fn position_id(&self) -> Option<i64> {
        match self {
            IngestOutcome::Executed { position_id, .. } => Some(*position_id),
            _ => None,
        }
    }
}

/// Point-in-time view of the gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub capital: CapitalState,
    pub open_positions: Vec<Position>,
    /// Approved intents whose execution has not been committed yet
    pub in_flight: usize,
    pub halted: bool,
}

#[derive(Debug, Clone)]
struct Reservation {
    size_usdc: Decimal,
    reserved_at: DateTime<Utc>,
}

struct GateState {
    tracker: PositionTracker,
    reservations: HashMap<String, Reservation>,
    halted: bool,
}

impl GateState {
    fn ensure_running(&self) -> Result<()> {
        if self.halted {
            return Err(ExecutorHalted.into());
        }
        Ok(())
    }

    fn halt(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!(error = %err, "Storage failure, executor halted");
        self.halted = true;
        err
    }

    async fn record(&mut self, record: DecisionRecord) -> Result<i64> {
        match self.tracker.record_decision(record).await {
            Ok(id) => Ok(id),
            Err(e) => Err(self.halt(e)),
        }
    }

    fn reserved_usdc(&self) -> Decimal {
        self.reservations.values().map(|r| r.size_usdc).sum()
    }
}

/// Log fields captured before validation, so rejected payloads are logged as received.
struct Envelope {
    intent_id: Option<String>,
    source_trader: Option<String>,
    market_id: Option<String>,
    received_at: DateTime<Utc>,
    payload: String,
}

impl Envelope {
    fn new(raw: &RawIntent, payload: String, received_at: DateTime<Utc>) -> Self {
        Self {
            intent_id: raw.intent_id.clone(),
            source_trader: raw.source_trader.clone(),
            market_id: raw.market_id.clone(),
            received_at,
            payload,
        }
    }

    fn entry(&self, accepted: bool, reason: Option<&str>, detail: Option<String>) -> IntentLogEntry {
        IntentLogEntry {
            id: 0,
            intent_id: self.intent_id.clone(),
            source_trader: self.source_trader.clone(),
            market_id: self.market_id.clone(),
            received_at: self.received_at,
            accepted,
            reason: reason.map(str::to_string),
            detail,
            payload: self.payload.clone(),
        }
    }
}

/// Gate orchestrator. Cloning shares the same state.
#[derive(Clone)]
pub struct Executor {
    state: Arc<Mutex<GateState>>,
    validator: IntentValidator,
    allowlist: AllowlistHandle,
    execution: Arc<dyn ExecutionClient>,
    alerts: Arc<dyn AlertDispatcher>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        tracker: PositionTracker,
        validator: IntentValidator,
        allowlist: AllowlistHandle,
        execution: Arc<dyn ExecutionClient>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                tracker,
                reservations: HashMap::new(),
                halted: false,
            })),
            validator,
            allowlist,
            execution,
            alerts,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ingest one JSON-encoded intent.
    pub async fn ingest_json(&self, payload: &str) -> Result<IngestOutcome> {
        match RawIntent::from_json(payload) {
            Ok(raw) => {
                let envelope = Envelope::new(&raw, payload.to_string(), self.clock.now());
                self.process(raw, envelope).await
            }
            Err(detail) => self.reject_malformed(payload, detail).await,
        }
    }

    /// Log a payload that could not be decoded at all as a `malformed` rejection.
    pub async fn reject_malformed(&self, payload: &str, detail: String) -> Result<IngestOutcome> {
        let envelope = Envelope {
            intent_id: RawIntent::sniff_intent_id(payload),
            source_trader: None,
            market_id: None,
            received_at: self.clock.now(),
            payload: payload.to_string(),
        };
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        self.reject_validation(
            &mut state,
            &envelope,
            Rejected {
                reason: ValidationRejection::Malformed,
                detail,
            },
        )
        .await
    }

    /// Ingest an already-decoded intent.
    pub async fn ingest(&self, raw: RawIntent) -> Result<IngestOutcome> {
        let received_at = self.clock.now();
        let payload = serde_json::to_string(&raw)?;
        let envelope = Envelope::new(&raw, payload, received_at);
        self.process(raw, envelope).await
    }

    async fn process(&self, raw: RawIntent, envelope: Envelope) -> Result<IngestOutcome> {
        let checked = self.validator.precheck(raw, envelope.received_at);
        let snapshot = self.allowlist.current().await;

        let mut state = self.state.lock().await;
        state.ensure_running()?;

        let intent = match checked {
            Validation::Accept(intent) => intent,
            Validation::Reject(rejected) => {
                return self.reject_validation(&mut state, &envelope, rejected).await;
            }
        };

        let seen = match state.tracker.intent_seen(&intent.intent_id).await {
            Ok(seen) => seen,
            Err(e) => return Err(state.halt(e)),
        };
        if let Some(rejected) = self.validator.admit(&intent, &snapshot, seen) {
            return self.reject_validation(&mut state, &envelope, rejected).await;
        }

        let now = self.clock.now();
        let capital = state.tracker.capital_at(now);
        let rolled = capital.day_boundary != state.tracker.capital().day_boundary;
        let in_use = state.tracker.open_count() + state.reservations.len();
        let size = intent.notional_usdc();

        let kernel = state.tracker.kernel().clone();
        let decision = kernel.decide(&capital, in_use, size);

        let reason = match decision {
            RiskDecision::Approve => None,
            RiskDecision::Reject(rule) => Some(rule),
        };
        let mut record = DecisionRecord {
            entry: envelope.entry(
                decision.is_approved(),
                reason.as_ref().map(RiskRejection::as_str),
                None,
            ),
            risk_event: None,
            capital: rolled.then(|| capital.clone()),
        };
        if rolled {
            info!(day = %capital.day_boundary, "UTC day rolled over, daily PnL reset");
        }

        let mut kill_event: Option<RiskEvent> = None;
        match reason {
            Some(RiskRejection::HardKill) => {
                let details = kernel
                    .event_for(RiskRejection::HardKill, &capital, now)
                    .map(|e| e.details)
                    .unwrap_or_default();
                if let Some((killed, event)) =
                    kernel.kill_transition(&capital, RiskEventKind::HardKill, details, now)
                {
                    record.capital = Some(killed);
                    record.risk_event = Some(event.clone());
                    kill_event = Some(event);
                }
            }
            Some(RiskRejection::DailyStop)
                if !state.tracker.daily_stop_noted(capital.day_boundary) =>
            {
                record.risk_event = kernel.event_for(RiskRejection::DailyStop, &capital, now);
            }
            _ => {}
        }

        state.record(record).await?;

        if let Some(rule) = reason {
            drop(state);
            warn!(intent_id = %intent.intent_id, reason = %rule, size = %size, "Intent rejected by risk kernel");
            if let Some(event) = kill_event {
                self.alert(AlertEvent::KillTriggered {
                    kind: event.kind,
                    details: event.details,
                });
            }
            return Ok(self.rejected(Some(intent.intent_id), RejectReason::Risk(rule), None));
        }

        state.reservations.insert(
            intent.intent_id.clone(),
            Reservation {
                size_usdc: size,
                reserved_at: now,
            },
        );
        debug!(
            intent_id = %intent.intent_id,
            in_flight = state.reservations.len(),
            reserved_usdc = %state.reserved_usdc(),
            "Capital reserved"
        );
        drop(state);

        info!(
            intent_id = %intent.intent_id,
            market = %intent.market_id,
            side = intent.side.as_str(),
            size = %size,
            "Intent approved, executing"
        );
        let result = self
            .execution
            .execute(&intent, size)
            .await
            .and_then(|fill| match intent.tokens_at(fill.fill_price) {
                Ok(tokens) => Ok((fill, tokens)),
                Err(detail) => {
                    error!(
                        intent_id = %intent.intent_id,
                        fill_price = %fill.fill_price,
                        order_id = ?fill.order_id,
                        detail = %detail,
                        "Unacceptable fill, recording as failed"
                    );
                    Err(ExecutionError::RejectedByVenue(detail))
                }
            });

        let mut state = self.state.lock().await;
        if let Some(reservation) = state.reservations.remove(&intent.intent_id) {
            debug!(
                intent_id = %intent.intent_id,
                held_ms = (self.clock.now() - reservation.reserved_at).num_milliseconds(),
                "Reservation released"
            );
        }
        let done_at = self.clock.now();

        match result {
            Ok((fill, tokens)) => {
                let position = Position::new(
                    intent.intent_id.clone(),
                    intent.market_id.clone(),
                    intent.outcome,
                    intent.side,
                    tokens,
                    fill.fill_price,
                    done_at,
                );
                let trade = TradeRecord::executed(
                    &intent.intent_id,
                    0,
                    &intent.market_id,
                    size,
                    fill.fill_price,
                    done_at,
                );
                let position = match state.tracker.open(position, trade).await {
                    Ok(position) => position,
                    Err(e) => return Err(state.halt(e)),
                };
                drop(state);

                info!(
                    intent_id = %intent.intent_id,
                    position_id = position.id,
                    fill_price = %fill.fill_price,
                    cost_basis = %position.cost_basis(),
                    order_id = ?fill.order_id,
                    "Trade executed"
                );
                self.alert(AlertEvent::TradeExecuted {
                    intent_id: intent.intent_id.clone(),
                    market_id: intent.market_id.clone(),
                    position_id: position.id,
                    size_usdc: size,
                    fill_price: fill.fill_price,
                });
                Ok(IngestOutcome::Executed {
                    intent_id: intent.intent_id,
                    position_id: position.id,
                    size_usdc: size,
                    fill_price: fill.fill_price,
                })
            }
            Err(error) => {
                let trade = TradeRecord::failed(
                    &intent.intent_id,
                    &intent.market_id,
                    size,
                    error.to_string(),
                    done_at,
                );
                if let Err(e) = state.tracker.record_failed(trade).await {
                    return Err(state.halt(e));
                }
                drop(state);

                warn!(intent_id = %intent.intent_id, kind = error.as_str(), error = %error, "Execution failed");
                self.alert(AlertEvent::ExecutionFailed {
                    intent_id: intent.intent_id.clone(),
                    error: error.to_string(),
                });
                Ok(IngestOutcome::ExecutionFailed {
                    intent_id: intent.intent_id,
                    error,
                })
            }
        }
    }

    async fn reject_validation(
        &self,
        state: &mut GateState,
        envelope: &Envelope,
        rejected: Rejected,
    ) -> Result<IngestOutcome> {
        let entry = envelope.entry(false, Some(rejected.reason.as_str()), Some(rejected.detail.clone()));
        state
            .record(DecisionRecord {
                entry,
                risk_event: None,
                capital: None,
            })
            .await?;

        warn!(
            intent_id = ?envelope.intent_id,
            reason = %rejected.reason,
            detail = %rejected.detail,
            "Intent rejected by validator"
        );
        Ok(self.rejected(
            envelope.intent_id.clone(),
            RejectReason::Validation(rejected.reason),
            Some(rejected.detail),
        ))
    }

    fn rejected(&self, intent_id: Option<String>, reason: RejectReason, detail: Option<String>) -> IngestOutcome {
        self.alert(AlertEvent::IntentRejected {
            intent_id: intent_id.clone(),
            reason: reason.as_str().to_string(),
        });
        IngestOutcome::Rejected {
            intent_id,
            reason,
            detail,
        }
    }

    /// Close an open position at a resolution value or exit price.
    pub async fn close_position(
        &self,
        position_id: i64,
        value: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;

        if state.tracker.position(position_id).is_none() {
            bail!("No open position with id {}", position_id);
        }
        if value < Decimal::ZERO || value > Decimal::ONE {
            bail!("Close value must be within [0, 1], got {}", value);
        }

        let closed = match state
            .tracker
            .close(position_id, value, reason, self.clock.now())
            .await
        {
            Ok(closed) => closed,
            Err(e) => return Err(state.halt(e)),
        };
        drop(state);

        self.alert(AlertEvent::PositionClosed {
            position_id,
            realized_pnl: closed.realized_pnl,
        });
        if let Some(event) = &closed.risk_event {
            self.alert(AlertEvent::KillTriggered {
                kind: event.kind,
                details: event.details.clone(),
            });
        }
        Ok(closed)
    }

    /// Manual kill. Returns `false` when already killed.
    pub async fn kill(&self, reason: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let event = match state
            .tracker
            .kill(RiskEventKind::ManualKill, reason, self.clock.now())
            .await
        {
            Ok(event) => event,
            Err(e) => return Err(state.halt(e)),
        };
        drop(state);

        match event {
            Some(event) => {
                warn!(reason = %reason, "Manual kill persisted");
                self.alert(AlertEvent::KillTriggered {
                    kind: event.kind,
                    details: event.details,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn status(&self) -> GateStatus {
        let state = self.state.lock().await;
        GateStatus {
            capital: state.tracker.capital().clone(),
            open_positions: state.tracker.positions().cloned().collect(),
            in_flight: state.reservations.len(),
            halted: state.halted,
        }
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    fn alert(&self, event: AlertEvent) {
        let alerts = self.alerts.clone();
        tokio::spawn(async move {
            if let Err(e) = alerts.notify(&event).await {
                warn!(error = %e, "Alert dispatch failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::AllowlistSnapshot;
    use crate::api::{DryRunClient, Fill, LogDispatcher};
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::models::TradeIntent;
    use crate::risk::{RiskConfig, RiskKernel};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct FailingClient(ExecutionError);

    #[async_trait]
    impl ExecutionClient for FailingClient {
        async fn execute(&self, _: &TradeIntent, _: Decimal) -> Result<Fill, ExecutionError> {
            Err(self.0.clone())
        }
    }

    /// Reports every order as filled at a fixed price.
    struct FillAt(Decimal);

    #[async_trait]
    impl ExecutionClient for FillAt {
        async fn execute(&self, _: &TradeIntent, _: Decimal) -> Result<Fill, ExecutionError> {
            Ok(Fill {
                fill_price: self.0,
                order_id: Some("venue-1".into()),
            })
        }
    }

    /// Holds `slow-*` intents until released; fills everything else at once.
    #[derive(Default)]
    struct GatedClient {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ExecutionClient for GatedClient {
        async fn execute(&self, intent: &TradeIntent, _: Decimal) -> Result<Fill, ExecutionError> {
            if intent.intent_id.starts_with("slow") {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(Fill {
                fill_price: intent.price_limit,
                order_id: None,
            })
        }
    }

    struct FailingAlerts;

    #[async_trait]
    impl AlertDispatcher for FailingAlerts {
        async fn notify(&self, _: &AlertEvent) -> Result<()> {
            bail!("webhook down")
        }
    }

    struct Harness {
        executor: Executor,
        db: Database,
        clock: Arc<ManualClock>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    async fn build(
        db: Database,
        clock: Arc<ManualClock>,
        allowlist: AllowlistSnapshot,
        execution: Arc<dyn ExecutionClient>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Executor {
        let tracker = PositionTracker::load(
            db,
            RiskKernel::new(RiskConfig::default()),
            dec!(1000),
            clock.now(),
        )
        .await
        .unwrap();
        Executor::new(
            tracker,
            IntentValidator::default(),
            AllowlistHandle::new(allowlist),
            execution,
            alerts,
        )
        .with_clock(clock)
    }

    async fn harness_with(
        allowlist: AllowlistSnapshot,
        execution: Arc<dyn ExecutionClient>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Harness {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let executor = build(db.clone(), clock.clone(), allowlist, execution, alerts).await;
        Harness {
            executor,
            db,
            clock,
        }
    }

    async fn harness() -> Harness {
        harness_with(markets(), Arc::new(DryRunClient), Arc::new(LogDispatcher)).await
    }

    fn markets() -> AllowlistSnapshot {
        AllowlistSnapshot::new(["0xmarket", "0xother"], Vec::<String>::new())
    }

    fn intent(id: &str, at: DateTime<Utc>, side: &str, price: &str, usdc: &str) -> String {
        json!({
            "intent_id": id,
            "timestamp": at.to_rfc3339(),
            "source_trader": "0xwhale",
            "market_id": "0xmarket",
            "outcome": "YES",
            "side": side,
            "price_limit": price,
            "size_usdc": usdc,
        })
        .to_string()
    }

    impl Harness {
        async fn send(&self, id: &str, side: &str, price: &str, usdc: &str) -> IngestOutcome {
            let payload = intent(id, self.clock.now(), side, price, usdc);
            self.executor.ingest_json(&payload).await.unwrap()
        }

        /// Open a BUY of `usdc` at 0.50 and return its position id.
        async fn open(&self, id: &str, usdc: &str) -> i64 {
            let outcome = self.send(id, "BUY", "0.50", usdc).await;
            outcome.position_id().unwrap()
        }

        async fn close(&self, position_id: i64, value: Decimal) -> ClosedPosition {
            self.executor
                .close_position(position_id, value, CloseReason::Resolution)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_approved_intent_opens_position() {
        let h = harness().await;
        let outcome = h.send("i-1", "BUY", "0.40", "20").await;

        assert_eq!(
            outcome,
            IngestOutcome::Executed {
                intent_id: "i-1".into(),
                position_id: 1,
                size_usdc: dec!(20),
                fill_price: dec!(0.40),
            }
        );
        let status = h.executor.status().await;
        assert_eq!(status.open_positions.len(), 1);
        assert_eq!(status.open_positions[0].size, dec!(50));
        assert_eq!(status.in_flight, 0);

        let logged = h.db.recent_intents(10).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].accepted);
        assert_eq!(h.db.trade_stats().await.unwrap().executed, 1);
    }

    #[tokio::test]
    async fn test_every_rejection_is_logged() {
        let h = harness().await;
        h.executor.ingest_json("{not json").await.unwrap();
        h.executor
            .ingest_json(r#"{"intent_id": "i-2", "side": "BUY"}"#)
            .await
            .unwrap();

        let logged = h.db.recent_intents(10).await.unwrap();
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|e| !e.accepted));
        assert!(logged.iter().all(|e| e.reason.as_deref() == Some("malformed")));
        assert_eq!(logged[0].intent_id.as_deref(), Some("i-2"));
        assert_eq!(logged[1].payload, "{not json");
    }

    #[tokio::test]
    async fn test_stale_intent_rejected() {
        let h = harness().await;
        let payload = intent("i-1", h.clock.now() - Duration::seconds(11), "BUY", "0.40", "20");
        let outcome = h.executor.ingest_json(&payload).await.unwrap();
        assert_eq!(
            outcome.rejection(),
            Some(RejectReason::Validation(ValidationRejection::Stale))
        );
    }

    #[tokio::test]
    async fn test_duplicate_intent_rejected() {
        let h = harness().await;
        assert!(h.send("i-1", "BUY", "0.40", "20").await.is_executed());
        let again = h.send("i-1", "BUY", "0.40", "20").await;
        assert_eq!(
            again.rejection(),
            Some(RejectReason::Validation(ValidationRejection::Duplicate))
        );
        assert_eq!(h.executor.status().await.open_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_allowlist_rejects_everything() {
        let h = harness_with(
            AllowlistSnapshot::empty(),
            Arc::new(DryRunClient),
            Arc::new(LogDispatcher),
        )
        .await;
        for (i, market) in ["0xmarket", "0xother", "0xanything"].iter().enumerate() {
            let payload = json!({
                "intent_id": format!("i-{}", i),
                "timestamp": h.clock.now().to_rfc3339(),
                "source_trader": "0xwhale",
                "market_id": market,
                "outcome": "NO",
                "side": "BUY",
                "price_limit": "0.40",
                "size_usdc": "10",
            })
            .to_string();
            let outcome = h.executor.ingest_json(&payload).await.unwrap();
            assert_eq!(
                outcome.rejection(),
                Some(RejectReason::Validation(ValidationRejection::AllowlistEmpty))
            );
        }
    }

    #[tokio::test]
    async fn test_per_trade_cap() {
        let h = harness().await;
        let outcome = h.send("i-1", "BUY", "0.40", "30.01").await;
        assert_eq!(
            outcome.rejection(),
            Some(RejectReason::Risk(RiskRejection::PerTradeCap))
        );
        assert!(h.send("i-2", "BUY", "0.40", "30").await.is_executed());
    }

    #[tokio::test]
    async fn test_daily_stop_then_rollover() {
        let h = harness().await;

        let a = h.open("i-1", "25").await;
        let b = h.open("i-2", "25").await;
        h.close(a, dec!(0)).await;
        h.close(b, dec!(0)).await;
        assert_eq!(h.executor.status().await.capital.daily_pnl, dec!(-50));

        let blocked = h.send("i-3", "BUY", "0.50", "10").await;
        assert_eq!(
            blocked.rejection(),
            Some(RejectReason::Risk(RiskRejection::DailyStop))
        );
        h.send("i-4", "BUY", "0.50", "10").await;
        let events = h.db.recent_risk_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RiskEventKind::DailyStop);

        h.clock.advance(Duration::days(1));
        let next_day = h.send("i-5", "BUY", "0.50", "10").await;
        assert!(next_day.is_executed());

        let status = h.executor.status().await;
        assert_eq!(status.capital.daily_pnl, dec!(0));
        assert_eq!(status.capital.total_pnl, dec!(-50));
        assert_eq!(h.db.load_capital_state().await.unwrap().unwrap().daily_pnl, dec!(0));
    }

    #[tokio::test]
    async fn test_hard_kill_survives_restart() {
        let h = harness().await;

        // -90 per day for two days, then -20: total -200 on a 1000 base
        for day in 0..2 {
            let mut ids = Vec::new();
            for n in 0..3 {
                ids.push(h.open(&format!("d{}-{}", day, n), "30").await);
            }
            for id in ids {
                h.close(id, dec!(0)).await;
            }
            h.clock.advance(Duration::days(1));
        }
        let last = h.open("d2-0", "20").await;
        h.close(last, dec!(0)).await;
        assert_eq!(h.executor.status().await.capital.total_pnl, dec!(-200));

        let outcome = h.send("k-1", "BUY", "0.50", "10").await;
        assert_eq!(
            outcome.rejection(),
            Some(RejectReason::Risk(RiskRejection::HardKill))
        );
        let events = h.db.recent_risk_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == RiskEventKind::HardKill));

        // restart from the same store
        h.clock.advance(Duration::days(1));
        let restarted = build(
            h.db.clone(),
            h.clock.clone(),
            markets(),
            Arc::new(DryRunClient),
            Arc::new(LogDispatcher),
        )
        .await;
        assert!(restarted.status().await.capital.killed);
        let payload = intent("k-2", h.clock.now(), "BUY", "0.50", "10");
        let outcome = restarted.ingest_json(&payload).await.unwrap();
        assert_eq!(
            outcome.rejection(),
            Some(RejectReason::Risk(RiskRejection::Killed))
        );
    }

    #[tokio::test]
    async fn test_anomalous_loss_kills_with_positive_total() {
        let h = harness().await;

        // BUY 100 tokens at 0.30, resolves to 1: +70
        let win = h.send("i-1", "BUY", "0.30", "30").await.position_id().unwrap();
        h.close(win, dec!(1)).await;

        // SELL 100 tokens at 0.30, exits at 0.90: -60
        let lose = h.send("i-2", "SELL", "0.30", "30").await.position_id().unwrap();
        let closed = h.close(lose, dec!(0.90)).await;

        assert_eq!(closed.realized_pnl, dec!(-60));
        assert_eq!(
            closed.risk_event.map(|e| e.kind),
            Some(RiskEventKind::AnomalousLoss)
        );
        let status = h.executor.status().await;
        assert!(status.capital.killed);
        assert_eq!(status.capital.total_pnl, dec!(10));
    }

    #[tokio::test]
    async fn test_killed_rejects_every_valid_intent() {
        let h = harness().await;
        assert!(h.executor.kill("operator halt").await.unwrap());
        assert!(!h.executor.kill("again").await.unwrap());

        for (i, usdc) in ["1", "30", "500"].iter().enumerate() {
            let outcome = h.send(&format!("i-{}", i), "BUY", "0.50", usdc).await;
            assert_eq!(
                outcome.rejection(),
                Some(RejectReason::Risk(RiskRejection::Killed))
            );
        }
        let events = h.db.recent_risk_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RiskEventKind::ManualKill);
    }

    #[tokio::test]
    async fn test_concurrent_intents_respect_position_limit() {
        let h = harness().await;
        h.open("i-1", "10").await;
        h.open("i-2", "10").await;

        let now = h.clock.now();
        let first = intent("c-1", now, "BUY", "0.50", "10");
        let second = intent("c-2", now, "BUY", "0.50", "10");
        let (a, b) = futures::future::join(
            h.executor.ingest_json(&first),
            h.executor.ingest_json(&second),
        )
        .await;
        let outcomes = [a.unwrap(), b.unwrap()];

        let approved = outcomes.iter().filter(|o| o.is_executed()).count();
        let limited = outcomes
            .iter()
            .filter(|o| o.rejection() == Some(RejectReason::Risk(RiskRejection::PositionLimit)))
            .count();
        assert_eq!(approved, 1);
        assert_eq!(limited, 1);
        assert_eq!(h.executor.status().await.open_positions.len(), 3);
    }

    #[tokio::test]
    async fn test_execution_holds_reservation_without_the_lock() {
        let client = Arc::new(GatedClient::default());
        let h = harness_with(markets(), client.clone(), Arc::new(LogDispatcher)).await;
        h.open("i-1", "10").await;
        h.open("i-2", "10").await;

        let executor = h.executor.clone();
        let payload = intent("slow-1", h.clock.now(), "BUY", "0.50", "10");
        let slow = tokio::spawn(async move { executor.ingest_json(&payload).await });
        let wait = std::time::Duration::from_secs(5);
        tokio::time::timeout(wait, client.entered.notified())
            .await
            .unwrap();

        let status = tokio::time::timeout(wait, h.executor.status()).await.unwrap();
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.open_positions.len(), 2);

        // the reserved slot counts against the limit
        let payload = intent("i-3", h.clock.now(), "BUY", "0.50", "10");
        let blocked = tokio::time::timeout(wait, h.executor.ingest_json(&payload))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            blocked.rejection(),
            Some(RejectReason::Risk(RiskRejection::PositionLimit))
        );

        client.release.notify_one();
        let outcome = tokio::time::timeout(wait, slow).await.unwrap().unwrap().unwrap();
        assert!(outcome.is_executed());

        let status = h.executor.status().await;
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.open_positions.len(), 3);
    }

    #[tokio::test]
    async fn test_sub_tick_price_is_malformed() {
        let h = harness().await;
        let outcome = h
            .send("i-1", "BUY", "0.0000000000000000000000000001", "30")
            .await;
        assert_eq!(
            outcome.rejection(),
            Some(RejectReason::Validation(ValidationRejection::Malformed))
        );
        assert!(h.executor.status().await.open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_overflowing_fill_is_recorded_as_failed() {
        let h = harness_with(
            markets(),
            Arc::new(FillAt(dec!(0.0000000000000000000000000001))),
            Arc::new(LogDispatcher),
        )
        .await;
        let outcome = h.send("i-1", "BUY", "0.50", "30").await;
        assert!(matches!(
            outcome,
            IngestOutcome::ExecutionFailed {
                error: ExecutionError::RejectedByVenue(_),
                ..
            }
        ));

        let status = h.executor.status().await;
        assert!(status.open_positions.is_empty());
        assert_eq!(status.in_flight, 0);
        let trades = h.db.trades_for_intent("i-1").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].error.as_deref().unwrap().contains("overflows"));
    }

    #[tokio::test]
    async fn test_zero_fill_is_rejected() {
        let h = harness_with(markets(), Arc::new(FillAt(dec!(0))), Arc::new(LogDispatcher)).await;
        let outcome = h.send("i-1", "BUY", "0.50", "20").await;
        assert!(matches!(
            outcome,
            IngestOutcome::ExecutionFailed {
                error: ExecutionError::RejectedByVenue(_),
                ..
            }
        ));
        assert!(h.executor.status().await.open_positions.is_empty());
        assert_eq!(h.db.trade_stats().await.unwrap().executed, 0);
    }

    #[tokio::test]
    async fn test_fill_beyond_limit_cannot_exceed_cap() {
        let h = harness_with(markets(), Arc::new(FillAt(dec!(0.99))), Arc::new(LogDispatcher)).await;

        // 300 tokens at 0.10 is exactly the 30 USDC cap
        let payload = json!({
            "intent_id": "i-1",
            "timestamp": h.clock.now().to_rfc3339(),
            "source_trader": "0xwhale",
            "market_id": "0xmarket",
            "outcome": "YES",
            "side": "BUY",
            "price_limit": "0.10",
            "size_tokens": "300",
        })
        .to_string();
        let outcome = h.executor.ingest_json(&payload).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::ExecutionFailed {
                error: ExecutionError::RejectedByVenue(_),
                ..
            }
        ));
        assert!(h.executor.status().await.open_positions.is_empty());

        // a fill inside the limit opens at the filled cost
        let h = harness_with(markets(), Arc::new(FillAt(dec!(0.08))), Arc::new(LogDispatcher)).await;
        let outcome = h.executor.ingest_json(&payload).await.unwrap();
        assert!(outcome.is_executed());
        let status = h.executor.status().await;
        assert_eq!(status.open_positions[0].cost_basis(), dec!(24));
    }

    #[tokio::test]
    async fn test_execution_failure_rolls_back() {
        let h = harness_with(
            markets(),
            Arc::new(FailingClient(ExecutionError::Timeout)),
            Arc::new(LogDispatcher),
        )
        .await;
        let before = h.executor.status().await.capital;

        let outcome = h.send("i-1", "BUY", "0.50", "20").await;
        assert_eq!(
            outcome,
            IngestOutcome::ExecutionFailed {
                intent_id: "i-1".into(),
                error: ExecutionError::Timeout,
            }
        );

        let status = h.executor.status().await;
        assert_eq!(status.capital, before);
        assert!(status.open_positions.is_empty());
        assert_eq!(status.in_flight, 0);

        let trades = h.db.trades_for_intent("i-1").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].error.as_deref(), Some("execution timed out"));
        assert!(trades[0].realized_pnl.is_none());
    }

    #[tokio::test]
    async fn test_alert_failure_is_swallowed() {
        let h = harness_with(markets(), Arc::new(DryRunClient), Arc::new(FailingAlerts)).await;
        assert!(h.send("i-1", "BUY", "0.50", "20").await.is_executed());
        tokio::task::yield_now().await;
        assert!(h.send("i-2", "BUY", "0.50", "20").await.is_executed());
    }

    #[tokio::test]
    async fn test_storage_failure_halts() {
        let h = harness().await;
        sqlx::query("DROP TABLE positions")
            .execute(h.db.pool())
            .await
            .unwrap();

        let payload = intent("i-1", h.clock.now(), "BUY", "0.50", "20");
        assert!(h.executor.ingest_json(&payload).await.is_err());
        assert!(h.executor.is_halted().await);

        let payload = intent("i-2", h.clock.now(), "BUY", "0.50", "20");
        let err = h.executor.ingest_json(&payload).await.unwrap_err();
        assert!(err.downcast_ref::<ExecutorHalted>().is_some());
        assert!(!h.db.intent_seen("i-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_unknown_position_does_not_halt() {
        let h = harness().await;
        assert!(h
            .executor
            .close_position(99, dec!(1), CloseReason::Manual)
            .await
            .is_err());
        assert!(!h.executor.is_halted().await);
    }

    #[test]
    fn test_outcome_json() {
        let outcome = IngestOutcome::Rejected {
            intent_id: Some("i-1".into()),
            reason: RejectReason::Risk(RiskRejection::DailyStop),
            detail: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "daily_stop");
    }
}
