// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::payments::PaymentError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::UnknownPlan(amount) => {
                ApiError::bad_request(format!("no plan costs {amount}"))
            }
            PaymentError::Invalid(reason) => ApiError::bad_request(reason),
            PaymentError::WalletActive(until) => ApiError::conflict(format!(
                "a payment address for another amount is active until {}",
                until.to_rfc3339()
            )),
            other if other.is_transient() => {
                error!(error = %other, "Payment backend unavailable");
                ApiError::unavailable("payment backend unavailable")
            }
            other => {
                error!(error = %other, "Payment request failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use chrono::Utc;

    use crate::payments::{Amount, LedgerError};
    use crate::security::CipherError;

    #[test]
    fn payment_errors_map_to_statuses() {
        let cases = [
            (PaymentError::UnknownPlan(Amount::whole(1)), StatusCode::BAD_REQUEST),
            (PaymentError::Invalid("empty".into()), StatusCode::BAD_REQUEST),
            (PaymentError::WalletActive(Utc::now()), StatusCode::CONFLICT),
            (
                PaymentError::Ledger(LedgerError::Request("timeout".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PaymentError::Cipher(CipherError::KeyUnavailable),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ApiError::from(PaymentError::Cipher(CipherError::KeyUnavailable));
        assert_eq!(err.message, "internal error");
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
