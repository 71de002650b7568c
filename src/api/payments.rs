// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Internal payment endpoints called by the bot front end.
//!
//! Every request must carry `x-internal-token` matching the sealed
//! `INTERNAL_API_TOKEN`. When no token is configured the endpoints answer
//! 503.

use axum::{extract::State, http::HeaderMap, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::payments::{Amount, IssuedWallet, PaymentDecision, Plan};
use crate::security::sealed::INTERNAL_API_TOKEN;
use crate::state::AppState;
use crate::storage::UserId;

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .settings
        .open(INTERNAL_API_TOKEN)
        .ok_or_else(|| ApiError::unavailable("internal API disabled"))?;
    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid internal token"))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddressRequest {
    pub user_id: UserId,
    /// Plan price in USDT.
    #[schema(value_type = String, example = "105")]
    pub amount: Amount,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyRequest {
    pub user_id: UserId,
    pub tx_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub status: String,
    pub subscription_end: DateTime<Utc>,
    pub plan_days: u32,
}

/// Issue a one-time receiving address for a plan price.
#[utoipa::path(
    post,
    path = "/v1/payments/address",
    tag = "Payments",
    request_body = AddressRequest,
    responses(
        (status = 200, description = "Address issued or reused", body = IssuedWallet),
        (status = 400, description = "Amount matches no plan"),
        (status = 401, description = "Missing or wrong internal token"),
        (status = 409, description = "Another address is still active")
    )
)]
pub async fn create_address(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AddressRequest>,
) -> Result<Json<IssuedWallet>, ApiError> {
    authorize(&state, &headers)?;
    let wallet = state
        .monitor
        .generate_payment_address(request.user_id, request.amount)
        .await?;
    Ok(Json(wallet))
}

/// Manually verify a transaction id.
///
/// Anything other than a fresh credit answers 404 "payment not found".
#[utoipa::path(
    post,
    path = "/v1/payments/verify",
    tag = "Payments",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Payment credited", body = VerifyResponse),
        (status = 401, description = "Missing or wrong internal token"),
        (status = 404, description = "Payment not found"),
        (status = 503, description = "Ledger or database unavailable")
    )
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    authorize(&state, &headers)?;
    match state
        .monitor
        .check_payment(request.user_id, &request.tx_id)
        .await?
    {
        PaymentDecision::Confirmed(subscription) => Ok(Json(VerifyResponse {
            status: "confirmed".to_string(),
            subscription_end: subscription.end_date,
            plan_days: subscription.plan_days,
        })),
        _ => Err(ApiError::not_found("payment not found")),
    }
}

/// Plan catalog.
#[utoipa::path(
    get,
    path = "/v1/plans",
    tag = "Payments",
    responses((status = 200, description = "Available plans", body = Vec<Plan>))
)]
pub async fn list_plans(State(state): State<AppState>) -> Json<Vec<Plan>> {
    Json(state.monitor.plans().plans().to_vec())
}
