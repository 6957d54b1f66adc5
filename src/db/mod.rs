//! Durable audit store for the gate.
//!
//! Stores everything needed to resume after restart:
//! - Capital state snapshots (newest row is current)
//! - Positions, open and closed
//! - Trade history, intent log and risk events (append-only, enforced by triggers)
//! - Schema version metadata
//!
//! Every mutating call is a single transaction. The pool holds one connection so
//! there is exactly one writer.

mod rows;

use anyhow::{bail, Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};

use crate::models::{
    CapitalState, IntentLogEntry, Position, PositionStatus, RiskEvent, TradeRecord,
};

use rows::{
    fmt_date, fmt_decimal, fmt_opt_decimal, fmt_opt_ts, fmt_ts, StoredCapital, StoredIntent,
    StoredPosition, StoredRiskEvent, StoredTrade,
};

/// Version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// The store was written by an incompatible build. There is no in-place migration.
#[derive(Debug, thiserror::Error)]
#[error("unsupported schema version {found} (this build requires {expected}); migrate out of band")]
pub struct SchemaError {
    pub found: String,
    pub expected: i64,
}

/// One intent's decision: the log row plus any stop/kill it caused.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub entry: IntentLogEntry,
    pub risk_event: Option<RiskEvent>,
    /// Capital snapshot to append (kill or day roll)
    pub capital: Option<CapitalState>,
}

/// Outcome of an execution call: the trade row and, when filled, the new position.
#[derive(Debug, Clone)]
pub struct ExecutionCommit {
    pub trade: TradeRecord,
    pub position: Option<Position>,
}

/// Closing a position: the closed row, its settlement trade, the new capital state.
#[derive(Debug, Clone)]
pub struct CloseCommit {
    pub position: Position,
    pub trade: TradeRecord,
    pub capital: CapitalState,
    pub risk_event: Option<RiskEvent>,
}

/// Trade history counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradeStats {
    pub executed: i64,
    pub failed: i64,
    pub closed: i64,
}

/// Database connection pool with full state management.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and verify (or stamp) the schema version.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create tables on a fresh store; refuse a store with another version.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let version: Option<(String,)> =
            sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some((v,)) if v == SCHEMA_VERSION.to_string() => Ok(()),
            Some((v,)) => Err(SchemaError {
                found: v,
                expected: SCHEMA_VERSION,
            }
            .into()),
            None => self.create_schema().await,
        }
    }

    async fn create_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS capital_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                capital_base TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                total_pnl TEXT NOT NULL,
                day_boundary TEXT NOT NULL,
                killed INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                closed_at TEXT,
                exit_value TEXT,
                realized_pnl TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                id TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                position_id INTEGER,
                market_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                size TEXT NOT NULL,
                price TEXT,
                realized_pnl TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS intent_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent_id TEXT,
                source_trader TEXT,
                market_id TEXT,
                received_at TEXT NOT NULL,
                accepted INTEGER NOT NULL,
                reason TEXT,
                detail TEXT,
                payload TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                details TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_intent_log_intent ON intent_log(intent_id)",
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
            "CREATE INDEX IF NOT EXISTS idx_trade_history_intent ON trade_history(intent_id)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        for table in ["trade_history", "intent_log", "risk_events", "capital_state"] {
            for op in ["UPDATE", "DELETE"] {
                let trigger = format!(
                    "CREATE TRIGGER IF NOT EXISTS {table}_no_{op_lower} BEFORE {op} ON {table} \
                     BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END",
                    table = table,
                    op = op,
                    op_lower = op.to_lowercase(),
                );
                sqlx::query(&trigger).execute(&mut *tx).await?;
            }
        }

        sqlx::query("INSERT INTO metadata (key, value) VALUES ('schema_version', ?)")
            .bind(SCHEMA_VERSION.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to create schema")?;
        Ok(())
    }

    /// Stored schema version.
    pub async fn schema_version(&self) -> Result<String> {
        let (value,): (String,) =
            sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                .fetch_one(&self.pool)
                .await
                .context("Schema version missing")?;
        Ok(value)
    }

    // ==================== Capital State ====================

    /// Current capital state, `None` on a fresh store.
    pub async fn load_capital_state(&self) -> Result<Option<CapitalState>> {
        let row = sqlx::query_as::<_, StoredCapital>(
            "SELECT * FROM capital_state ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load capital state")?;

        row.map(CapitalState::try_from).transpose()
    }

    /// Append the first capital snapshot of a fresh store.
    pub async fn init_capital_state(&self, capital: &CapitalState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_capital(&mut tx, capital).await?;
        tx.commit().await.context("Failed to seed capital state")?;
        Ok(())
    }

    // ==================== Decisions ====================

    /// Persist one intent decision atomically. Returns the intent log row id.
    pub async fn apply_decision(&self, record: &DecisionRecord) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let entry = &record.entry;
        let log_id = sqlx::query(
            r#"
            INSERT INTO intent_log (
                intent_id, source_trader, market_id, received_at, accepted, reason, detail, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.intent_id)
        .bind(&entry.source_trader)
        .bind(&entry.market_id)
        .bind(fmt_ts(&entry.received_at))
        .bind(entry.accepted)
        .bind(&entry.reason)
        .bind(&entry.detail)
        .bind(&entry.payload)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        if let Some(event) = &record.risk_event {
            insert_risk_event(&mut tx, event).await?;
        }
        if let Some(capital) = &record.capital {
            insert_capital(&mut tx, capital).await?;
        }

        tx.commit().await.context("Failed to commit decision")?;
        Ok(log_id)
    }

    /// Whether an intent id appears anywhere in the intent log.
    pub async fn intent_seen(&self, intent_id: &str) -> Result<bool> {
        let result: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM intent_log WHERE intent_id = ? LIMIT 1")
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.is_some())
    }

    /// Most recent intent log rows, newest first.
    pub async fn recent_intents(&self, limit: i64) -> Result<Vec<IntentLogEntry>> {
        let rows = sqlx::query_as::<_, StoredIntent>(
            "SELECT * FROM intent_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch intent log")?;

        rows.into_iter().map(IntentLogEntry::try_from).collect()
    }

    // ==================== Executions ====================

    /// Record an execution result. Returns the new position id when one was opened.
    pub async fn commit_execution(&self, commit: &ExecutionCommit) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let position_id = match &commit.position {
            Some(position) => Some(insert_position(&mut tx, position).await?),
            None => None,
        };

        let mut trade = commit.trade.clone();
        if position_id.is_some() {
            trade.position_id = position_id;
        }
        insert_trade(&mut tx, &trade).await?;

        tx.commit().await.context("Failed to commit execution")?;
        Ok(position_id)
    }

    /// Close a position with its settlement trade and capital update.
    pub async fn commit_close(&self, commit: &CloseCommit) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let position = &commit.position;
        let updated = sqlx::query(
            r#"
            UPDATE positions SET
                status = ?,
                closed_at = ?,
                exit_value = ?,
                realized_pnl = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(PositionStatus::Closed.as_str())
        .bind(fmt_opt_ts(&position.closed_at))
        .bind(fmt_opt_decimal(&position.exit_value))
        .bind(fmt_opt_decimal(&position.realized_pnl))
        .bind(position.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated != 1 {
            bail!("Position {} is not open in the store", position.id);
        }

        insert_trade(&mut tx, &commit.trade).await?;
        insert_capital(&mut tx, &commit.capital).await?;
        if let Some(event) = &commit.risk_event {
            insert_risk_event(&mut tx, event).await?;
        }

        tx.commit().await.context("Failed to commit close")?;
        Ok(())
    }

    /// Persist a kill that did not come from an intent decision (manual kill).
    pub async fn record_kill(&self, event: &RiskEvent, capital: &CapitalState) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_risk_event(&mut tx, event).await?;
        insert_capital(&mut tx, capital).await?;
        tx.commit().await.context("Failed to commit kill")?;
        Ok(id)
    }

    // ==================== Positions ====================

    /// All open positions, oldest first.
    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'open' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        rows.into_iter().map(Position::try_from).collect()
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")?;

        row.map(Position::try_from).transpose()
    }

    // ==================== Trade History ====================

    /// Trade rows for one intent, in insertion order.
    pub async fn trades_for_intent(&self, intent_id: &str) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trade_history WHERE intent_id = ? ORDER BY rowid",
        )
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    pub async fn trade_stats(&self) -> Result<TradeStats> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT kind, status, COUNT(*) FROM trade_history GROUP BY kind, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TradeStats::default();
        for (kind, status, count) in rows {
            match (kind.as_str(), status.as_str()) {
                ("entry", "executed") => stats.executed += count,
                ("entry", "failed") => stats.failed += count,
                ("close", _) => stats.closed += count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // ==================== Intent File Checkpoints ====================

    /// Byte offset just past the last line consumed from the intent file `source`.
    pub async fn intent_file_offset(&self, source: &str) -> Result<Option<u64>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(offset_key(source))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load intent file offset")?;

        row.map(|(value,)| {
            value
                .parse()
                .with_context(|| format!("Corrupt intent file offset: {:?}", value))
        })
        .transpose()
    }

    pub async fn save_intent_file_offset(&self, source: &str, offset: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(offset_key(source))
        .bind(offset.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save intent file offset")?;
        Ok(())
    }

    // ==================== Risk Events ====================

    /// Most recent risk events, newest first.
    pub async fn recent_risk_events(&self, limit: i64) -> Result<Vec<RiskEvent>> {
        let rows = sqlx::query_as::<_, StoredRiskEvent>(
            "SELECT * FROM risk_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch risk events")?;

        rows.into_iter().map(RiskEvent::try_from).collect()
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn offset_key(source: &str) -> String {
    format!("intent_file_offset:{}", source)
}

async fn insert_capital(tx: &mut Transaction<'_, Sqlite>, capital: &CapitalState) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO capital_state (capital_base, daily_pnl, total_pnl, day_boundary, killed, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(fmt_decimal(&capital.capital_base))
    .bind(fmt_decimal(&capital.daily_pnl))
    .bind(fmt_decimal(&capital.total_pnl))
    .bind(fmt_date(&capital.day_boundary))
    .bind(capital.killed)
    .bind(fmt_ts(&capital.updated_at))
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();
    Ok(id)
}

async fn insert_risk_event(tx: &mut Transaction<'_, Sqlite>, event: &RiskEvent) -> Result<i64> {
    let id = sqlx::query("INSERT INTO risk_events (kind, triggered_at, details) VALUES (?, ?, ?)")
        .bind(event.kind.as_str())
        .bind(fmt_ts(&event.triggered_at))
        .bind(&event.details)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();
    Ok(id)
}

async fn insert_position(tx: &mut Transaction<'_, Sqlite>, position: &Position) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO positions (
            intent_id, market_id, outcome, side, size, entry_price, opened_at, status
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&position.intent_id)
    .bind(&position.market_id)
    .bind(position.outcome.as_str())
    .bind(position.side.as_str())
    .bind(fmt_decimal(&position.size))
    .bind(fmt_decimal(&position.entry_price))
    .bind(fmt_ts(&position.opened_at))
    .bind(position.status.as_str())
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();
    Ok(id)
}

async fn insert_trade(tx: &mut Transaction<'_, Sqlite>, trade: &TradeRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO trade_history (
            id, intent_id, position_id, market_id, kind, status, size, price,
            realized_pnl, error, created_at, resolved_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&trade.id)
    .bind(&trade.intent_id)
    .bind(trade.position_id)
    .bind(&trade.market_id)
    .bind(trade.kind.as_str())
    .bind(trade.status.as_str())
    .bind(fmt_decimal(&trade.size))
    .bind(fmt_opt_decimal(&trade.price))
    .bind(fmt_opt_decimal(&trade.realized_pnl))
    .bind(&trade.error)
    .bind(fmt_ts(&trade.created_at))
    .bind(fmt_opt_ts(&trade.resolved_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
