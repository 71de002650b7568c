// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted payment entities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::payments::Amount;

/// Telegram user id.
pub type UserId = i64;

/// Lifecycle status of a [`PaymentRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "rejected" => Some(PaymentStatus::Rejected),
            _ => None,
        }
    }
}

/// One on-chain transfer, keyed by its network transaction id.
///
/// A `confirmed` row is the record that a subscription credit was applied
/// for this transaction id; the status never leaves `confirmed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub tx_id: String,
    pub user_id: UserId,
    pub asset: String,
    pub amount: Amount,
    pub address: String,
    pub status: PaymentStatus,
    pub confirmations: u32,
    pub observed_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// A freshly announced, not yet verified transfer.
    pub fn pending(
        tx_id: impl Into<String>,
        user_id: UserId,
        asset: impl Into<String>,
        amount: Amount,
        address: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            user_id,
            asset: asset.into(),
            amount,
            address: address.into(),
            status: PaymentStatus::Pending,
            confirmations: 0,
            observed_at,
        }
    }
}

/// One-time receiving address bound to a user and an expected amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralWallet {
    pub address: String,
    pub user_id: UserId,
    pub amount: Amount,
    pub plan_days: u32,
    /// Hex ciphertext from the cipher service.
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralWallet {
    /// Expired once `now` is past `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Paid subscription window for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Subscription {
    pub user_id: UserId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub plan_days: u32,
    pub payment_method: String,
}

impl Subscription {
    /// Apply a credit of `plan_days` at `now`.
    ///
    /// An active subscription is extended from its current end; an expired
    /// or missing one starts over at `now`.
    pub fn extended(
        current: Option<Subscription>,
        user_id: UserId,
        plan_days: u32,
        payment_method: &str,
        now: DateTime<Utc>,
    ) -> Subscription {
        let days = Duration::days(i64::from(plan_days));
        match current {
            Some(sub) if sub.end_date > now => Subscription {
                end_date: sub.end_date + days,
                plan_days,
                payment_method: payment_method.to_string(),
                ..sub
            },
            _ => Subscription {
                user_id,
                start_date: now,
                end_date: now + days,
                plan_days,
                payment_method: payment_method.to_string(),
            },
        }
    }
}
