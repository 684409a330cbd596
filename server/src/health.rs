use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::SystemTime;

use crate::db::DbPool;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    database: CheckStatus,
    memory: CheckStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    database: bool,
}

/// Liveness probe - checks if the application is running.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - checks database connectivity. Returns 503 until the
/// pool can serve a trivial query.
pub async fn readiness(State(pool): State<DbPool>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ready = check_database(&pool).await;
    let status = if db_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(ReadinessResponse { ready: db_ready, checks: ReadinessChecks { database: db_ready } }))
}

/// Detailed health information for operators.
pub async fn health(State(pool): State<DbPool>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = if check_database(&pool).await { CheckStatus::Healthy } else { CheckStatus::Unhealthy };
    let overall_healthy = matches!(db_status, CheckStatus::Healthy);
    let status = if overall_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks { database: db_status, memory: CheckStatus::Healthy },
        }),
    )
}

async fn check_database(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readiness_reports_ready_against_live_pool() {
        let pool = crate::db::init_db(crate::db::DbConfig {
            database_path: ":memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let (status, Json(body)) = readiness(State(pool)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ready);
    }
}
