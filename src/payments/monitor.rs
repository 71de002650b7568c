// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Integrity Monitor
//!
//! Issues one-time receiving wallets and decides whether a transaction id
//! may be credited to a user's subscription.
//!
//! ## Payment lifecycle
//!
//! ```text
//! initiated ──(wallet issued)──► pending ──► confirmed
//!                                   │
//!                                   └──────► rejected (mismatch / expired)
//! ```
//!
//! A transaction id is credited only if, at the time of the check:
//!
//! 1. the user's wallet has not expired,
//! 2. the ledger reports at least `min_confirmations` confirmations,
//! 3. the deposited amount equals the wallet's expected amount exactly,
//! 4. the destination equals the wallet address,
//! 5. the tx id has not been credited before.
//!
//! Step 5 and the subscription extension run in one transaction: the
//! `confirmed` payment row is inserted (or upgraded from `pending`) only if
//! no `confirmed` row exists, so concurrent checks of the same tx id from
//! the poller and a manual verification credit at most once.
//!
//! The ledger is queried outside any transaction so no database lease is
//! held across the network call.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use zeroize::Zeroizing;

use super::amount::Amount;
use super::ledger::{Ledger, LedgerError};
use super::plans::PlanCatalog;
use crate::clock::{Clock, SystemClock};
use crate::metrics::Metrics;
use crate::security::{AuditEventType, AuditLog, CipherError, CipherService};
use crate::storage::{
    EphemeralWallet, PaymentRecord, PaymentStatus, ResilientStore, StoreError, Subscription,
    UserId,
};

/// Monitor tunables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub asset: String,
    pub wallet_ttl: Duration,
    pub min_confirmations: u32,
    /// Pending records examined per sweep.
    pub batch_size: usize,
    pub payment_method: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            asset: "USDT".to_string(),
            wallet_ttl: Duration::minutes(30),
            min_confirmations: 1,
            batch_size: 100,
            payment_method: "binance".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("no plan costs {0}")]
    UnknownPlan(Amount),
    #[error("an unexpired wallet for a different amount exists until {0}")]
    WalletActive(DateTime<Utc>),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl PaymentError {
    /// Connectivity failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        match self {
            PaymentError::Store(e) => matches!(
                e,
                StoreError::Connection(_)
                    | StoreError::Unavailable(_)
                    | StoreError::AcquireTimeout(_)
            ),
            PaymentError::Ledger(e) => {
                matches!(e, LedgerError::Request(_) | LedgerError::Status(_))
            }
            _ => false,
        }
    }
}

/// Why a transaction was not credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoWallet,
    WalletExpired,
    AmountMismatch,
    AddressMismatch,
    /// Already credited, or announced by a different user.
    AlreadyClaimed,
    PreviouslyRejected,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::NoWallet => "no_wallet",
            RejectReason::WalletExpired => "wallet_expired",
            RejectReason::AmountMismatch => "amount_mismatch",
            RejectReason::AddressMismatch => "address_mismatch",
            RejectReason::AlreadyClaimed => "already_claimed",
            RejectReason::PreviouslyRejected => "previously_rejected",
        }
    }
}

/// Outcome of checking one transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDecision {
    /// Credited now; carries the extended subscription.
    Confirmed(Subscription),
    /// Seen on the ledger with too few confirmations.
    AwaitingConfirmations(u32),
    /// Not (yet) on the ledger.
    NotFound,
    Rejected(RejectReason),
}

/// Wallet handed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct IssuedWallet {
    pub address: String,
    #[schema(value_type = String, example = "105")]
    pub amount: Amount,
    pub expires_at: DateTime<Utc>,
    /// True when an unexpired wallet for the same amount was returned.
    pub reused: bool,
}

/// Counters for one poll sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub waiting: usize,
    pub failed: usize,
}

enum WalletIssue {
    Created(EphemeralWallet),
    Reused(EphemeralWallet),
    Conflict(DateTime<Utc>),
}

/// Decides and records subscription credits.
pub struct PaymentMonitor {
    store: Arc<ResilientStore>,
    ledger: Arc<dyn Ledger>,
    cipher: Arc<CipherService>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    plans: PlanCatalog,
    config: MonitorConfig,
    metrics: Option<Arc<Metrics>>,
}

impl PaymentMonitor {
    pub fn new(
        store: Arc<ResilientStore>,
        ledger: Arc<dyn Ledger>,
        cipher: Arc<CipherService>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            ledger,
            cipher,
            audit,
            clock: Arc::new(SystemClock),
            plans: PlanCatalog::default(),
            config: MonitorConfig::default(),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_plans(mut self, plans: PlanCatalog) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    fn new_wallet(
        &self,
        user_id: UserId,
        amount: Amount,
        plan_days: u32,
        now: DateTime<Utc>,
    ) -> Result<EphemeralWallet, PaymentError> {
        let mut rng = rand::thread_rng();

        let mut address_bytes = [0u8; 16];
        rng.fill_bytes(&mut address_bytes);
        let address = format!("T{}", Base64UrlUnpadded::encode_string(&address_bytes));

        let mut key = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut key[..]);
        let key_hex = Zeroizing::new(hex::encode(&key[..]));
        let encrypted_key = self.cipher.encrypt(&key_hex)?;

        Ok(EphemeralWallet {
            address,
            user_id,
            amount,
            plan_days,
            encrypted_key,
            created_at: now,
            expires_at: now + self.config.wallet_ttl,
        })
    }

    /// Issue a receiving address for `amount`.
    ///
    /// An unexpired wallet for the same amount is returned again; one for a
    /// different amount fails with [`PaymentError::WalletActive`].
    pub async fn generate_payment_address(
        &self,
        user_id: UserId,
        amount: Amount,
    ) -> Result<IssuedWallet, PaymentError> {
        let plan_days = self
            .plans
            .days_for(amount)
            .ok_or(PaymentError::UnknownPlan(amount))?;
        let now = self.clock.now();
        let candidate = self.new_wallet(user_id, amount, plan_days, now)?;

        let issue = self
            .store
            .with_transaction(move |conn| {
                let candidate = candidate.clone();
                Box::pin(async move {
                    conn.lock_user(candidate.user_id).await?;
                    if let Some(existing) = conn.latest_wallet(candidate.user_id).await? {
                        if !existing.is_expired_at(now) {
                            if existing.amount == candidate.amount {
                                return Ok(WalletIssue::Reused(existing));
                            }
                            return Ok(WalletIssue::Conflict(existing.expires_at));
                        }
                    }
                    conn.insert_wallet(&candidate).await?;
                    Ok(WalletIssue::Created(candidate))
                })
            })
            .await?;

        let (wallet, reused) = match issue {
            WalletIssue::Created(wallet) => (wallet, false),
            WalletIssue::Reused(wallet) => (wallet, true),
            WalletIssue::Conflict(expires_at) => {
                return Err(PaymentError::WalletActive(expires_at));
            }
        };

        let event_type = if reused {
            AuditEventType::WalletReused
        } else {
            AuditEventType::WalletGenerated
        };
        self.audit.log(
            self.audit
                .user_event(event_type, user_id)
                .with_resource("wallet", wallet.address.clone())
                .with_detail(format!("amount={} days={}", wallet.amount, wallet.plan_days)),
        );
        info!(address = %wallet.address, amount = %wallet.amount, reused, "Payment address issued");

        Ok(IssuedWallet {
            address: wallet.address,
            amount: wallet.amount,
            expires_at: wallet.expires_at,
            reused,
        })
    }

    /// Register a transfer announced by a webhook so the poller checks it.
    ///
    /// Returns `false` if the tx id is already known.
    pub async fn record_intent(
        &self,
        user_id: UserId,
        tx_id: &str,
        amount: Amount,
        address: &str,
    ) -> Result<bool, PaymentError> {
        let tx_id = tx_id.trim();
        if tx_id.is_empty() {
            return Err(PaymentError::Invalid("tx_id must not be empty".into()));
        }
        let record = PaymentRecord::pending(
            tx_id,
            user_id,
            self.config.asset.clone(),
            amount,
            address,
            self.clock.now(),
        );

        let inserted = self
            .store
            .with_transaction(move |conn| {
                let record = record.clone();
                Box::pin(async move { conn.insert_pending(&record).await })
            })
            .await?;

        if inserted {
            self.audit.log(
                self.audit
                    .user_event(AuditEventType::PaymentIntentRecorded, user_id)
                    .with_resource("payment", tx_id),
            );
        }
        Ok(inserted)
    }

    /// Manual verification: `true` only if this call credited the payment.
    pub async fn verify_payment(&self, user_id: UserId, tx_id: &str) -> bool {
        match self.check_payment(user_id, tx_id).await {
            Ok(PaymentDecision::Confirmed(_)) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Payment verification failed");
                false
            }
        }
    }

    /// Run every check for `tx_id` and credit it if all pass.
    pub async fn check_payment(
        &self,
        user_id: UserId,
        tx_id: &str,
    ) -> Result<PaymentDecision, PaymentError> {
        let tx_id = tx_id.trim().to_string();
        if tx_id.is_empty() {
            return Err(PaymentError::Invalid("tx_id must not be empty".into()));
        }

        let lookup_tx = tx_id.clone();
        let (wallet, existing) = self
            .store
            .with_transaction(move |conn| {
                let tx_id = lookup_tx.clone();
                Box::pin(async move {
                    let wallet = conn.latest_wallet(user_id).await?;
                    let existing = conn.get_payment(&tx_id).await?;
                    Ok((wallet, existing))
                })
            })
            .await?;

        if let Some(existing) = &existing {
            match existing.status {
                PaymentStatus::Confirmed => {
                    return Ok(self.block_double_spend(user_id, &tx_id));
                }
                PaymentStatus::Rejected if existing.user_id == user_id => {
                    return Ok(PaymentDecision::Rejected(RejectReason::PreviouslyRejected));
                }
                // Another user's failed claim does not bind the owner.
                PaymentStatus::Rejected => {}
                PaymentStatus::Pending if existing.user_id != user_id => {
                    return Ok(self.block_double_spend(user_id, &tx_id));
                }
                PaymentStatus::Pending => {}
            }
        }

        let Some(wallet) = wallet else {
            return self
                .reject(user_id, &tx_id, RejectReason::NoWallet, None)
                .await;
        };
        if wallet.is_expired_at(self.clock.now()) {
            return self
                .reject(user_id, &tx_id, RejectReason::WalletExpired, Some(&wallet))
                .await;
        }

        let Some(deposit) = self.ledger.find_deposit(&self.config.asset, &tx_id).await? else {
            return Ok(PaymentDecision::NotFound);
        };

        if deposit.confirmations < self.config.min_confirmations {
            return Ok(PaymentDecision::AwaitingConfirmations(deposit.confirmations));
        }
        // The ledger call may have taken a while; expiry is judged on arrival.
        let now = self.clock.now();
        let rejection = if wallet.is_expired_at(now) {
            Some(RejectReason::WalletExpired)
        } else if deposit.amount != wallet.amount {
            Some(RejectReason::AmountMismatch)
        } else if deposit.address != wallet.address {
            Some(RejectReason::AddressMismatch)
        } else {
            None
        };
        if let Some(reason) = rejection {
            return self.reject(user_id, &tx_id, reason, Some(&wallet)).await;
        }

        let record = PaymentRecord {
            tx_id: tx_id.clone(),
            user_id,
            asset: deposit.asset,
            amount: deposit.amount,
            address: deposit.address,
            status: PaymentStatus::Confirmed,
            confirmations: deposit.confirmations,
            observed_at: now,
        };
        let plan_days = wallet.plan_days;
        let payment_method = self.config.payment_method.clone();

        let credited = self
            .store
            .with_transaction(move |conn| {
                let record = record.clone();
                let payment_method = payment_method.clone();
                Box::pin(async move {
                    if !conn.claim_confirmed(&record).await? {
                        return Ok(None);
                    }
                    let current = conn.get_subscription(record.user_id).await?;
                    let extended = Subscription::extended(
                        current,
                        record.user_id,
                        plan_days,
                        &payment_method,
                        now,
                    );
                    conn.upsert_subscription(&extended).await?;
                    Ok(Some(extended))
                })
            })
            .await?;

        match credited {
            Some(subscription) => {
                self.audit.log(
                    self.audit
                        .user_event(AuditEventType::PaymentConfirmed, user_id)
                        .with_resource("payment", tx_id.clone())
                        .with_detail(format!(
                            "amount={} days={} until={}",
                            wallet.amount,
                            plan_days,
                            subscription.end_date.to_rfc3339()
                        )),
                );
                info!(tx_id = %tx_id, days = plan_days, "Payment confirmed and credited");
                if let Some(metrics) = &self.metrics {
                    metrics.record_credit(&self.config.payment_method);
                }
                Ok(PaymentDecision::Confirmed(subscription))
            }
            None => Ok(self.block_double_spend(user_id, &tx_id)),
        }
    }

    fn block_double_spend(&self, user_id: UserId, tx_id: &str) -> PaymentDecision {
        warn!(tx_id = %tx_id, "Transaction id already claimed");
        self.audit.log(
            self.audit
                .user_event(AuditEventType::DoubleSpendBlocked, user_id)
                .with_resource("payment", tx_id)
                .failed(),
        );
        PaymentDecision::Rejected(RejectReason::AlreadyClaimed)
    }

    /// Record the rejection against `user_id` so a retry of the same tx id
    /// by that user answers `PreviouslyRejected`.
    async fn reject(
        &self,
        user_id: UserId,
        tx_id: &str,
        reason: RejectReason,
        wallet: Option<&EphemeralWallet>,
    ) -> Result<PaymentDecision, PaymentError> {
        let mut record = PaymentRecord::pending(
            tx_id,
            user_id,
            self.config.asset.clone(),
            wallet.map_or(Amount::ZERO, |w| w.amount),
            wallet.map_or("", |w| w.address.as_str()),
            self.clock.now(),
        );
        record.status = PaymentStatus::Rejected;
        let persisted = self
            .store
            .with_transaction(move |conn| {
                let record = record.clone();
                Box::pin(async move { conn.mark_rejected(&record).await })
            })
            .await?;

        self.audit.log(
            self.audit
                .user_event(AuditEventType::PaymentRejected, user_id)
                .with_resource("payment", tx_id)
                .with_detail(reason.as_str())
                .failed(),
        );
        info!(tx_id = %tx_id, reason = reason.as_str(), persisted, "Payment rejected");
        Ok(PaymentDecision::Rejected(reason))
    }

    /// Check every pending record once.
    ///
    /// Individual failures are logged and skipped. If every record failed,
    /// the sweep itself is reported as failed.
    pub async fn confirm_pending(&self) -> Result<SweepSummary, PaymentError> {
        let limit = self.config.batch_size;
        let pending = self
            .store
            .with_transaction(move |conn| Box::pin(async move { conn.pending_payments(limit).await }))
            .await?;

        let mut summary = SweepSummary::default();
        let mut last_error = None;
        for record in pending {
            summary.checked += 1;
            match self.check_payment(record.user_id, &record.tx_id).await {
                Ok(PaymentDecision::Confirmed(_)) => summary.confirmed += 1,
                Ok(PaymentDecision::Rejected(_)) => summary.rejected += 1,
                Ok(PaymentDecision::AwaitingConfirmations(_) | PaymentDecision::NotFound) => {
                    summary.waiting += 1
                }
                Err(e) => {
                    warn!(tx_id = %record.tx_id, error = %e, "Failed to check pending payment");
                    summary.failed += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if summary.failed == summary.checked => Err(e),
            _ => Ok(summary),
        }
    }
}
