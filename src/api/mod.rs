// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    payments::{IssuedWallet, Plan},
    resilience::CircuitState,
    state::AppState,
    storage::PoolStatus,
    supervisor::{HealthCheck, HealthSnapshot},
};

pub mod health;
pub mod metrics;
pub mod payments;
pub mod webhooks;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let v1_routes = Router::new()
        .route("/payments/address", post(payments::create_address))
        .route("/payments/verify", post(payments::verify_payment))
        .route("/plans", get(payments::list_plans));

    let routes = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(metrics::metrics))
        .route("/webhook/kofi", post(webhooks::kofi_webhook))
        .route("/webhook/binance", post(webhooks::binance_webhook))
        .nest("/v1", v1_routes)
        .with_state(state);

    Router::new()
        .merge(routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::liveness,
        health::readiness,
        metrics::metrics,
        webhooks::kofi_webhook,
        webhooks::binance_webhook,
        payments::create_address,
        payments::verify_payment,
        payments::list_plans
    ),
    components(
        schemas(
            health::HealthResponse,
            health::ReadyResponse,
            webhooks::WebhookResponse,
            payments::AddressRequest,
            payments::VerifyRequest,
            payments::VerifyResponse,
            IssuedWallet,
            Plan,
            HealthSnapshot,
            HealthCheck,
            PoolStatus,
            CircuitState
        )
    ),
    tags(
        (name = "Health", description = "Liveness, readiness and metrics"),
        (name = "Webhooks", description = "Signed payment provider callbacks"),
        (name = "Payments", description = "Internal payment address and verification API")
    )
)]
struct ApiDoc;
