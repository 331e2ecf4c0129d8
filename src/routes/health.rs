use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::future::Future;
use std::time::Instant;

use crate::app_state::AppState;
use crate::services::circuit_breaker::BreakerSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: ComponentHealth,
    pub cache: ComponentHealth,
    pub database: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

async fn probe<F, E>(check: F) -> ComponentHealth
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    match check.await {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health probe failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    }
}

/// GET /health: dependency status plus every circuit breaker.
///
/// Open breakers are reported but do not make the worker unhealthy; the
/// heuristic path still terminates jobs.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue = probe(state.queue.health_check()).await;
    let cache = probe(state.cache.health_check()).await;
    let database = probe(async {
        sqlx::query("SELECT 1").execute(&state.db).await.map(|_| ())
    })
    .await;

    let all_healthy = queue.is_ok() && cache.is_ok() && database.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            queue,
            cache,
            database,
        },
        breakers: state.breakers.snapshots(),
    };

    (status_code, Json(response))
}
