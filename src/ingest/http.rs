//! Local HTTP ingestion endpoint.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::executor::Executor;
use crate::models::CloseReason;

#[derive(Debug, Serialize, Deserialize)]
pub struct KillRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseRequest {
    pub position_id: i64,
    /// Resolution value or exit price per token
    pub value: Decimal,
    /// `true` when `value` is the market's resolution value
    #[serde(default)]
    pub resolution: bool,
}

/// `POST /intents`, `GET /status`, `POST /kill`, `POST /close`.
pub fn router(executor: Executor) -> Router {
    Router::new()
        .route("/intents", post(submit_intent))
        .route("/status", get(status))
        .route("/kill", post(kill))
        .route("/close", post(close))
        .with_state(executor)
}

/// Serve the router on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr, executor: Executor) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Intent endpoint listening");
    axum::serve(listener, router(executor))
        .await
        .context("Intent endpoint failed")
}

fn unavailable(e: anyhow::Error) -> Response {
    error!(error = %e, "Request failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// Body is one intent JSON object. Every non-fatal outcome is a 200 with the
/// decision; 503 means the executor is halted.
async fn submit_intent(State(executor): State<Executor>, body: String) -> Response {
    match executor.ingest_json(&body).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn status(State(executor): State<Executor>) -> Response {
    Json(executor.status().await).into_response()
}

async fn kill(State(executor): State<Executor>, Json(request): Json<KillRequest>) -> Response {
    match executor.kill(&request.reason).await {
        Ok(newly_killed) => Json(json!({ "killed": true, "newly_killed": newly_killed })).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn close(State(executor): State<Executor>, Json(request): Json<CloseRequest>) -> Response {
    let reason = if request.resolution {
        CloseReason::Resolution
    } else {
        CloseReason::Manual
    };
    match executor
        .close_position(request.position_id, request.value, reason)
        .await
    {
        Ok(closed) => Json(json!({
            "position_id": closed.position.id,
            "realized_pnl": closed.realized_pnl,
            "killed": closed.risk_event.is_some(),
        }))
        .into_response(),
        Err(e) => {
            if executor.is_halted().await {
                return unavailable(e);
            }
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
