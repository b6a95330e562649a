//! HTTP trigger surface.
//!
//! | route                   | effect                                        |
//! |-------------------------|-----------------------------------------------|
//! | `GET /health`           | liveness                                      |
//! | `GET /stats`            | pool counters, engine sessions, row value     |
//! | `GET /scenarios`        | scenario catalog                              |
//! | `GET /{scenario}/`      | run a scenario; replies with an empty string  |
//! | `POST /run/{scenario}`  | run a scenario; replies with its report       |
//! | `POST /reset`           | reset the baseline row                        |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::{info, warn};

use crate::constants::SEED_KEY;
use crate::engine::SessionActivity;
use crate::error::Error;
use crate::harness::HarnessContext;
use crate::pool::PoolStats;
use crate::scenarios::{ScenarioKind, ScenarioReport};

pub type SharedContext = Arc<HarnessContext>;

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pool: PoolStats,
    pub sessions: Vec<SessionActivity>,
    /// Committed value of the contended row.
    pub row: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ScenarioInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Builds the router over a shared context.
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/scenarios", get(list_scenarios))
        .route("/reset", post(reset))
        .route("/run/{scenario}", post(run_scenario))
        .route("/{scenario}/", get(trigger_scenario))
        .with_state(ctx)
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /stats - Reads committed state directly; never takes a pool slot.
async fn stats(State(ctx): State<SharedContext>) -> Result<Json<StatsResponse>, AppError> {
    let row = ctx
        .engine()
        .store()
        .get(SEED_KEY)
        .map_err(|err| Error::db("read row", err))?;
    Ok(Json(StatsResponse {
        pool: ctx.pool().stats(),
        sessions: ctx.engine().activity(),
        row,
    }))
}

/// GET /scenarios
async fn list_scenarios() -> Json<Vec<ScenarioInfo>> {
    Json(
        ScenarioKind::ALL
            .into_iter()
            .map(|kind| ScenarioInfo {
                name: kind.name(),
                description: kind.description(),
            })
            .collect(),
    )
}

/// GET /{scenario}/ - Completes after the whole batch has joined.
async fn trigger_scenario(
    State(ctx): State<SharedContext>,
    Path(scenario): Path<String>,
) -> Result<Json<&'static str>, AppError> {
    ctx.invoke_named(&scenario).await?;
    Ok(Json(""))
}

/// POST /run/{scenario}
async fn run_scenario(
    State(ctx): State<SharedContext>,
    Path(scenario): Path<String>,
) -> Result<Json<ScenarioReport>, AppError> {
    Ok(Json(ctx.invoke_named(&scenario).await?))
}

/// POST /reset
async fn reset(State(ctx): State<SharedContext>) -> Result<StatusCode, AppError> {
    ctx.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serves the router until Ctrl-C, then closes the pool.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(ctx: SharedContext, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router(Arc::clone(&ctx)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    ctx.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
