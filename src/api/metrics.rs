// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::state::AppState;

/// Prometheus scrape endpoint.
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Health",
    responses(
        (status = 200, description = "Prometheus text exposition", content_type = "text/plain", body = String),
        (status = 500, description = "Metrics could not be encoded")
    )
)]
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render(&state.store.status()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::payments::Amount;
    use crate::supervisor::ErrorSink;
    use crate::testing::{app_state, fixture};

    async fn scrape(state: &crate::state::AppState) -> String {
        let request = Request::get("/metrics").body(Body::empty()).unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"), "{content_type}");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn scrape_reports_credits_errors_and_pool() {
        let fx = fixture();
        let state = app_state(&fx);

        let wallet = fx.monitor.generate_payment_address(1, Amount::whole(105)).await.unwrap();
        fx.ledger.insert("tx1", &wallet.address, Amount::whole(105), 1);
        assert!(fx.monitor.verify_payment(1, "tx1").await);
        state.supervisor.report_error("ledger timeout").await;

        // An unsigned webhook is rejected and counted.
        let request = Request::post("/webhook/kofi")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        router(state.clone()).oneshot(request).await.unwrap();

        let text = scrape(&state).await;
        assert!(text.contains("subscription_guard_payments_credited_total{method=\"binance\"} 1"));
        assert!(text.contains("subscription_guard_errors_reported_total 1"));
        assert!(text.contains(
            "subscription_guard_webhooks_total{outcome=\"rejected\",provider=\"kofi\"} 1"
        ));
        assert!(text.contains("subscription_guard_db_connections_in_use 0"));
        assert!(text.contains("subscription_guard_db_connections_capacity"));
    }

    #[tokio::test]
    async fn pool_gauge_counts_leased_connections() {
        let fx = fixture();
        let state = app_state(&fx);

        let lease = fx.store.acquire().await.unwrap();
        let text = scrape(&state).await;
        assert!(text.contains("subscription_guard_db_connections_in_use 1"));

        drop(lease);
        let text = scrape(&state).await;
        assert!(text.contains("subscription_guard_db_connections_in_use 0"));
    }
}
