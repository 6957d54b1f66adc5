//! copygate: fail-closed risk gate for copy-trading intents.
//!
//! Validates intents, applies the risk kernel, executes approved trades and
//! keeps a durable audit trail of every decision.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use polymarket_copy_gate::allowlist::{source, AllowlistHandle};
use polymarket_copy_gate::api::{
    AlertDispatcher, DryRunClient, ExecutionClient, HttpExecutionClient, LogDispatcher,
    WebhookDispatcher,
};
use polymarket_copy_gate::config::GateConfig;
use polymarket_copy_gate::db::Database;
use polymarket_copy_gate::executor::Executor;
use polymarket_copy_gate::ingest::{self, CloseRequest, KillRequest};
use polymarket_copy_gate::models::{CloseReason, RiskEventKind};
use polymarket_copy_gate::risk::RiskKernel;
use polymarket_copy_gate::tracker::PositionTracker;
use polymarket_copy_gate::validation::IntentValidator;

/// Risk gate for copy-trading intents.
#[derive(Parser)]
#[command(name = "copygate")]
#[command(about = "Validate, risk-check and execute copy-trading intents", long_about = None)]
struct Cli {
    /// Database URL (defaults to COPYGATE_DATABASE_URL, then ./copygate.db)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gate
    Run {
        /// Allowlist JSON file
        #[arg(short, long)]
        allowlist: Option<PathBuf>,

        /// NDJSON intent file to follow
        #[arg(short, long)]
        intent_file: Option<PathBuf>,

        /// Bind address for the HTTP intent endpoint
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Order-signing sidecar URL (dry-run fills when absent)
        #[arg(long)]
        execution_url: Option<String>,

        /// Capital base in USDC for a fresh store
        #[arg(short, long)]
        capital: Option<Decimal>,
    },

    /// Show capital state, open positions and trade counts
    Status,

    /// Show recent risk events
    Events {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show the recent intent log
    Intents {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Kill the gate; it stays killed until cleared administratively
    Kill {
        reason: String,

        /// Running gate's HTTP endpoint; without it the store is written directly
        #[arg(long)]
        gate: Option<String>,
    },

    /// Close an open position at an exit price or resolution value
    Close {
        position_id: i64,

        value: Decimal,

        /// `value` is the market's resolution value rather than an exit price
        #[arg(long)]
        resolution: bool,

        /// Running gate's HTTP endpoint; without it the store is written directly
        #[arg(long)]
        gate: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = GateConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    match cli.command {
        Commands::Run {
            allowlist,
            intent_file,
            http,
            execution_url,
            capital,
        } => {
            if let Some(path) = allowlist {
                config.allowlist_path = Some(path);
            }
            if let Some(path) = intent_file {
                config.intent_file = Some(path);
            }
            if let Some(addr) = http {
                config.http_bind = Some(addr);
            }
            if let Some(url) = execution_url {
                config.execution_url = Some(url);
            }
            if let Some(capital) = capital {
                config.capital_base = capital;
            }
            config.validate()?;
            run(config).await?;
        }

        Commands::Status => {
            let db = Database::new(&config.database_url).await?;
            let Some(capital) = db.load_capital_state().await? else {
                println!("No capital state found. Run 'copygate run' to start the gate.");
                return Ok(());
            };
            let positions = db.load_open_positions().await?;
            let stats = db.trade_stats().await?;

            println!("\n=== Capital ===");
            println!("Capital Base:     ${:.2}", capital.capital_base);
            println!(
                "Daily P&L:        ${:.2} ({})",
                capital.daily_pnl,
                pct(capital.daily_pnl_pct())
            );
            println!(
                "Total P&L:        ${:.2} ({})",
                capital.total_pnl,
                pct(capital.total_pnl_pct())
            );
            println!("Day:              {}", capital.day_boundary);
            println!("Killed:           {}", if capital.killed { "YES" } else { "No" });

            println!("\n=== Trading ===");
            println!("Open Positions:   {}", positions.len());
            println!("Executed:         {}", stats.executed);
            println!("Failed:           {}", stats.failed);
            println!("Closed:           {}", stats.closed);

            if !positions.is_empty() {
                println!("\n=== Open Positions ===");
                println!(
                    "{:>5} {:<24} {:<4} {:<4} {:>12} {:>8}",
                    "ID", "MARKET", "OUT", "SIDE", "SIZE", "ENTRY"
                );
                for pos in &positions {
                    println!(
                        "{:>5} {:<24} {:<4} {:<4} {:>12.4} {:>8.3}",
                        pos.id,
                        truncate(&pos.market_id, 22),
                        pos.outcome.as_str(),
                        pos.side.as_str(),
                        pos.size,
                        pos.entry_price
                    );
                }
            }
        }

        Commands::Events { limit } => {
            let db = Database::new(&config.database_url).await?;
            let events = db.recent_risk_events(limit).await?;
            if events.is_empty() {
                println!("No risk events recorded.");
                return Ok(());
            }
            println!("\n{:<26} {:<16} DETAILS", "TRIGGERED", "KIND");
            println!("{}", "-".repeat(80));
            for event in events {
                println!(
                    "{:<26} {:<16} {}",
                    event.triggered_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.kind.as_str(),
                    event.details
                );
            }
        }

        Commands::Intents { limit } => {
            let db = Database::new(&config.database_url).await?;
            let entries = db.recent_intents(limit).await?;
            if entries.is_empty() {
                println!("No intents recorded.");
                return Ok(());
            }
            println!(
                "\n{:<26} {:<24} {:<24} {:<8} REASON",
                "RECEIVED", "INTENT", "MARKET", "RESULT"
            );
            println!("{}", "-".repeat(100));
            for entry in entries {
                println!(
                    "{:<26} {:<24} {:<24} {:<8} {}",
                    entry.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    truncate(entry.intent_id.as_deref().unwrap_or("-"), 22),
                    truncate(entry.market_id.as_deref().unwrap_or("-"), 22),
                    if entry.accepted { "accepted" } else { "rejected" },
                    entry.reason.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Kill { reason, gate } => match gate {
            Some(gate) => {
                let body = post_json(&gate, "kill", &KillRequest { reason }).await?;
                println!("{}", body);
            }
            None => {
                let mut tracker = offline_tracker(&config).await?;
                match tracker
                    .kill(RiskEventKind::ManualKill, &reason, Utc::now())
                    .await?
                {
                    Some(_) => println!("Gate killed: {}", reason),
                    None => println!("Gate was already killed."),
                }
            }
        },

        Commands::Close {
            position_id,
            value,
            resolution,
            gate,
        } => match gate {
            Some(gate) => {
                let request = CloseRequest {
                    position_id,
                    value,
                    resolution,
                };
                let body = post_json(&gate, "close", &request).await?;
                println!("{}", body);
            }
            None => {
                let reason = if resolution {
                    CloseReason::Resolution
                } else {
                    CloseReason::Manual
                };
                let mut tracker = offline_tracker(&config).await?;
                let closed = tracker
                    .close(position_id, value, reason, Utc::now())
                    .await?;
                println!(
                    "Closed position {} at {}: P&L ${:.2}",
                    position_id, value, closed.realized_pnl
                );
                if let Some(event) = closed.risk_event {
                    println!("KILLED: {}", event.details);
                }
            }
        },

        Commands::Config => {
            let risk = &config.risk;

            println!("\n=== Gate Configuration ===\n");
            println!("Capital:");
            println!("  Capital Base:         ${}", config.capital_base);

            println!("\nRisk Limits:");
            println!("  Daily Stop:           {}%", risk.daily_stop_pct * dec!(100));
            println!("  Hard Kill:            {}%", risk.hard_kill_pct * dec!(100));
            println!("  Max Positions:        {}", risk.max_positions);
            println!("  Per-Trade Cap:        {}%", risk.per_trade_cap_pct * dec!(100));
            println!("  Anomalous Loss:       {}%", risk.anomalous_loss_pct * dec!(100));

            println!("\nValidation:");
            println!("  Staleness Threshold:  {}s", config.staleness_threshold_secs);
            println!("  Allowlist:            {}", display_path(&config.allowlist_path));
            println!("  Allowlist Refresh:    {}s", config.allowlist_refresh_secs);

            println!("\nIO:");
            println!("  Database:             {}", config.database_url);
            println!(
                "  Execution:            {}",
                config.execution_url.as_deref().unwrap_or("dry run")
            );
            println!("  Execution Timeout:    {}s", config.execution_timeout_secs);
            println!(
                "  Alerts:               {}",
                config.alert_webhook_url.as_deref().unwrap_or("log")
            );
            println!(
                "  HTTP Endpoint:        {}",
                config
                    .http_bind
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("  Intent File:          {}", display_path(&config.intent_file));

            if let Err(e) = config.validate() {
                println!("\nINVALID: {:#}", e);
            }
        }
    }

    Ok(())
}

async fn run(config: GateConfig) -> Result<()> {
    if config.http_bind.is_none() && config.intent_file.is_none() {
        bail!("Nothing to ingest: set --http or --intent-file (or COPYGATE_HTTP_BIND / COPYGATE_INTENT_FILE)");
    }

    let db = Database::new(&config.database_url).await?;
    let tracker = PositionTracker::load(
        db.clone(),
        RiskKernel::new(config.risk.clone()),
        config.capital_base,
        Utc::now(),
    )
    .await?;

    let allowlist = match &config.allowlist_path {
        Some(path) => {
            let handle = AllowlistHandle::new(source::initial(path).await);
            source::spawn_refresh(handle.clone(), path.clone(), config.allowlist_refresh());
            handle
        }
        None => {
            warn!("No allowlist configured, every intent will be rejected");
            AllowlistHandle::default()
        }
    };

    let execution: Arc<dyn ExecutionClient> = match &config.execution_url {
        Some(url) => Arc::new(HttpExecutionClient::with_timeout(
            url.clone(),
            config.execution_timeout(),
        )?),
        None => Arc::new(DryRunClient),
    };
    let alerts: Arc<dyn AlertDispatcher> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookDispatcher::new(url.clone())?),
        None => Arc::new(LogDispatcher),
    };

    let executor = Executor::new(
        tracker,
        IntentValidator::new(config.staleness_threshold()),
        allowlist,
        execution,
        alerts,
    );

    let status = executor.status().await;
    println!("\n=== Copy Gate ===");
    println!("Capital base:     ${}", status.capital.capital_base);
    println!("Total P&L:        ${:.2}", status.capital.total_pnl);
    println!("Open positions:   {}", status.open_positions.len());
    println!(
        "Mode:             {}",
        if config.execution_url.is_some() { "LIVE" } else { "DRY RUN (no real trades)" }
    );
    if status.capital.killed {
        println!("State:            KILLED (all intents will be rejected)");
    }
    println!("\nPress Ctrl+C to stop.\n");

    let mut tasks = Vec::new();
    if let Some(addr) = config.http_bind {
        tasks.push(tokio::spawn(ingest::serve(addr, executor.clone())));
    }
    if let Some(path) = config.intent_file.clone() {
        tasks.push(tokio::spawn(ingest::tail_ndjson(
            path,
            db.clone(),
            executor.clone(),
            config.intent_poll(),
        )));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        (finished, _, _) = futures::future::select_all(tasks) => {
            match finished {
                Ok(Ok(())) => info!("Ingestion task finished"),
                Ok(Err(e)) => {
                    error!(error = %e, "Ingestion stopped");
                    return Err(e);
                }
                Err(e) => return Err(e).context("Ingestion task panicked"),
            }
        }
    }

    let status = executor.status().await;
    println!("\n=== Final State ===");
    println!("Daily P&L:        ${:.2}", status.capital.daily_pnl);
    println!("Total P&L:        ${:.2}", status.capital.total_pnl);
    println!("Open positions:   {}", status.open_positions.len());
    println!("Killed:           {}", status.capital.killed);
    Ok(())
}

/// Tracker over the store for commands issued while the gate is stopped.
async fn offline_tracker(config: &GateConfig) -> Result<PositionTracker> {
    let db = Database::new(&config.database_url).await?;
    PositionTracker::load(
        db,
        RiskKernel::new(config.risk.clone()),
        config.capital_base,
        Utc::now(),
    )
    .await
}

async fn post_json<T: serde::Serialize>(gate: &str, path: &str, body: &T) -> Result<String> {
    let url = format!("{}/{}", gate.trim_end_matches('/'), path);
    let response = reqwest::Client::new()
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach gate at {}", url))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("Gate returned {}: {}", status, text);
    }
    Ok(text)
}

fn pct(value: Option<Decimal>) -> String {
    match value {
        Some(v) => format!("{:.2}%", v * dec!(100)),
        None => "n/a".to_string(),
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", head)
}
