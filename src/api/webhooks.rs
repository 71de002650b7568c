// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payment provider webhooks.
//!
//! Each request passes the webhook circuit breaker, then HMAC verification
//! of the canonical JSON body and a required-field check. Responses carry a
//! fixed `{"status": ...}` body and never echo the payload.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::payments::Amount;
use crate::security::sealed::{BINANCE_WEBHOOK_SECRET, KOFI_WEBHOOK_TOKEN};
use crate::security::signature::{has_required_fields, verify_signature};
use crate::security::{AuditEvent, AuditEventType};
use crate::state::AppState;
use crate::storage::UserId;
use crate::supervisor::ErrorSink;

pub const KOFI_SIGNATURE_HEADER: &str = "x-kofi-signature";
pub const BINANCE_SIGNATURE_HEADER: &str = "x-binance-signature";

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookResponse {
    /// `success`, `invalid` or `service unavailable`.
    pub status: String,
}

type WebhookReply = (StatusCode, Json<WebhookResponse>);

fn reply(status: StatusCode, marker: &str) -> WebhookReply {
    (
        status,
        Json(WebhookResponse {
            status: marker.to_string(),
        }),
    )
}

#[derive(Debug, Clone, Copy)]
enum Provider {
    Kofi,
    Binance,
}

impl Provider {
    fn name(self) -> &'static str {
        match self {
            Provider::Kofi => "kofi",
            Provider::Binance => "binance",
        }
    }

    fn signature_header(self) -> &'static str {
        match self {
            Provider::Kofi => KOFI_SIGNATURE_HEADER,
            Provider::Binance => BINANCE_SIGNATURE_HEADER,
        }
    }

    fn secret_name(self) -> &'static str {
        match self {
            Provider::Kofi => KOFI_WEBHOOK_TOKEN,
            Provider::Binance => BINANCE_WEBHOOK_SECRET,
        }
    }

    fn transaction_field(self) -> &'static str {
        match self {
            Provider::Kofi => "transaction_id",
            Provider::Binance => "tx_id",
        }
    }
}

/// `user_id` as a number or a numeric string.
fn user_id_of(payload: &Value) -> Option<UserId> {
    match payload.get("user_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn authenticate(state: &AppState, provider: Provider, headers: &HeaderMap, body: &[u8]) -> Option<Value> {
    let payload: Value = serde_json::from_slice(body).ok()?;
    let signature = headers
        .get(provider.signature_header())
        .and_then(|v| v.to_str().ok())?;
    let secret = state.settings.open(provider.secret_name())?;
    let valid =
        verify_signature(secret.as_bytes(), &payload, signature) && has_required_fields(&payload);
    valid.then_some(payload)
}

async fn handle(state: AppState, provider: Provider, headers: HeaderMap, body: Bytes) -> WebhookReply {
    if !state.breaker.allow_request() {
        warn!(provider = provider.name(), "Webhook shed by circuit breaker");
        state.metrics.record_webhook(provider.name(), "shed");
        state.audit.log(
            AuditEvent::new(AuditEventType::WebhookShed)
                .with_resource("webhook", provider.name())
                .failed(),
        );
        return reply(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    }

    let Some(payload) = authenticate(&state, provider, &headers, &body) else {
        warn!(provider = provider.name(), "Invalid webhook");
        state.breaker.record_failure();
        state.metrics.record_webhook(provider.name(), "rejected");
        state.audit.log(
            AuditEvent::new(AuditEventType::WebhookRejected)
                .with_resource("webhook", provider.name())
                .failed(),
        );
        return reply(StatusCode::FORBIDDEN, "invalid");
    };

    let user_id = user_id_of(&payload);
    let tx_id = payload
        .get(provider.transaction_field())
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if let (Provider::Binance, Some(tx_id)) = (provider, &tx_id) {
        let intent = user_id.zip(serde_json::from_value::<Amount>(payload["amount"].clone()).ok());
        let Some((user_id, amount)) = intent else {
            warn!(provider = provider.name(), "Webhook payment intent is malformed");
            state.breaker.record_failure();
            state.metrics.record_webhook(provider.name(), "rejected");
            state.audit.log(
                AuditEvent::new(AuditEventType::WebhookRejected)
                    .with_resource("webhook", provider.name())
                    .with_detail("malformed intent")
                    .failed(),
            );
            return reply(StatusCode::FORBIDDEN, "invalid");
        };
        let address = payload
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if let Err(e) = state.monitor.record_intent(user_id, tx_id, amount, address).await {
            warn!(provider = provider.name(), error = %e, "Failed to record payment intent");
            state.breaker.record_failure();
            state.metrics.record_webhook(provider.name(), "unavailable");
            // An exhausted error budget restarts the service from inside
            // report_error; the provider must get its 503 first.
            let supervisor = Arc::clone(&state.supervisor);
            let message = format!("webhook intent not recorded: {e}");
            tokio::spawn(async move { supervisor.report_error(&message).await });
            // The provider retries on 5xx.
            return reply(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
        }
    }

    state.breaker.record_success();
    let mut event = match user_id {
        Some(user_id) => state.audit.user_event(AuditEventType::WebhookAccepted, user_id),
        None => AuditEvent::new(AuditEventType::WebhookAccepted),
    };
    event = event.with_detail(provider.name());
    if let Some(tx_id) = &tx_id {
        event = event.with_resource("payment", tx_id.clone());
    }
    state.audit.log(event);
    info!(provider = provider.name(), "Webhook accepted");
    state.metrics.record_webhook(provider.name(), "accepted");

    reply(StatusCode::OK, "success")
}

/// Ko-fi donation webhook.
#[utoipa::path(
    post,
    path = "/webhook/kofi",
    tag = "Webhooks",
    request_body(content = Object, description = "Signed Ko-fi payload"),
    params(("X-Kofi-Signature" = String, Header, description = "hex HMAC-SHA256 of the canonical body")),
    responses(
        (status = 200, description = "Accepted", body = WebhookResponse),
        (status = 403, description = "Bad signature or missing fields", body = WebhookResponse),
        (status = 503, description = "Temporarily refusing webhooks", body = WebhookResponse)
    )
)]
pub async fn kofi_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    handle(state, Provider::Kofi, headers, body).await
}

/// Binance payment webhook. A payload with `tx_id` registers a pending
/// payment for the confirmation poller.
#[utoipa::path(
    post,
    path = "/webhook/binance",
    tag = "Webhooks",
    request_body(content = Object, description = "Signed Binance payload"),
    params(("X-Binance-Signature" = String, Header, description = "hex HMAC-SHA256 of the canonical body")),
    responses(
        (status = 200, description = "Accepted", body = WebhookResponse),
        (status = 403, description = "Bad signature or missing fields", body = WebhookResponse),
        (status = 503, description = "Temporarily refusing webhooks", body = WebhookResponse)
    )
)]
pub async fn binance_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    handle(state, Provider::Binance, headers, body).await
}
