//! Health Check & Metrics HTTP Server
//! Provides /health, /health/live, /health/ready, /metrics endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, instrument};

use super::metrics::{encode_metrics, get_metrics};

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: PgPool,
    pub nats_connected: Arc<AtomicBool>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    checks: HealthChecks,
}

#[derive(Serialize)]
struct HealthChecks {
    database: ComponentHealth,
    nats: ComponentHealth,
}

#[derive(Serialize)]
struct ComponentHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy(latency_ms: Option<u64>) -> Self {
        Self {
            status: "healthy",
            latency_ms,
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: "unhealthy",
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

#[instrument(skip(state))]
pub async fn start_health_server(port: u16, state: HealthState) -> anyhow::Result<()> {
    START_TIME.get_or_init(Instant::now);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Health/metrics server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[instrument(skip(state))]
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let database = match check_database(&state.db_pool).await {
        Ok(latency) => ComponentHealth::healthy(Some(latency)),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    };

    let nats = if state.nats_connected.load(Ordering::Relaxed) {
        ComponentHealth::healthy(None)
    } else {
        ComponentHealth::unhealthy("NATS not connected")
    };

    let overall_healthy = database.is_healthy() && nats.is_healthy();
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    let response = HealthResponse {
        status: if overall_healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        checks: HealthChecks { database, nats },
    };

    let status_code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

async fn check_database(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let start = Instant::now();
    let _row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;

    if let Some(metrics) = get_metrics() {
        metrics
            .db_pool_connections
            .with_label_values(&["active"])
            .set(pool.size() as f64 - pool.num_idle() as f64);
        metrics
            .db_pool_connections
            .with_label_values(&["idle"])
            .set(pool.num_idle() as f64);
    }

    Ok(start.elapsed().as_millis() as u64)
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

#[instrument(skip(state))]
async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reason": "initializing" })),
        );
    }

    let db_ok = check_database(&state.db_pool).await.is_ok();
    let nats_ok = state.nats_connected.load(Ordering::Relaxed);

    if db_ok && nats_ok {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": db_ok,
                "nats": nats_ok
            })),
        )
    }
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}
