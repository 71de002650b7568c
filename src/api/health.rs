// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::resilience::CircuitState;
use crate::state::AppState;
use crate::storage::PoolStatus;
use crate::supervisor::HealthSnapshot;

/// Readiness response with the supervisor's last probe cycle.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Overall status ("ok", "degraded" or "starting").
    pub status: String,
    /// Last health snapshot. Absent until the first probe cycle finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthSnapshot>,
    /// Connection pool usage.
    pub pool: PoolStatus,
    /// Webhook circuit breaker state.
    pub webhooks: CircuitState,
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
/// Does not check dependencies - use readiness for that.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe handler.
///
/// Reports the last supervisor snapshot rather than probing inline, so a
/// burst of readiness requests never fans out to the database or network.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse),
        (status = 503, description = "Service is not ready", body = ReadyResponse)
    )
)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let checks = state.supervisor.last_snapshot();
    let (status, code) = match &checks {
        Some(snapshot) if snapshot.all_ok() => ("ok", StatusCode::OK),
        Some(_) => ("degraded", StatusCode::SERVICE_UNAVAILABLE),
        None => ("starting", StatusCode::SERVICE_UNAVAILABLE),
    };

    let response = ReadyResponse {
        status: status.to_string(),
        checks,
        pool: state.store.status(),
        webhooks: state.breaker.state(),
    };
    (code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::api::router;
    use crate::testing::{app_state, fixture};

    async fn get(state: AppState, path: &str) -> (StatusCode, Value) {
        let request = Request::get(path).body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let fx = fixture();
        let (status, body) = get(app_state(&fx), "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn readiness_follows_supervisor_snapshot() {
        let fx = fixture();
        let state = app_state(&fx);

        let (status, body) = get(state.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "starting");
        assert_eq!(body["webhooks"], "closed");

        state.supervisor.run_checks().await;
        let (status, body) = get(state, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["checks"]["store"], true);
        assert_eq!(body["pool"]["capacity"], 5);
    }
}
