// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Backend seams for the resilient store.
//!
//! A [`Connector`] opens physical connections; a [`Connection`] runs the
//! transaction control statements plus the handful of payment queries the
//! service needs. Each backend maps its native failures onto
//! [`StoreError`], marking connectivity failures as
//! [`StoreError::Connection`].

use async_trait::async_trait;

use super::error::StoreResult;
use super::models::{EphemeralWallet, PaymentRecord, Subscription, UserId};

/// Opens new physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> StoreResult<Box<dyn Connection>>;
}

/// Queries over the payment tables.
///
/// Every method runs inside the caller's transaction.
#[async_trait]
pub trait PaymentTables: Send {
    /// Create tables if they do not exist.
    async fn ensure_schema(&mut self) -> StoreResult<()>;

    /// Serialize wallet issuance for one user until the transaction ends.
    async fn lock_user(&mut self, user_id: UserId) -> StoreResult<()>;

    async fn insert_wallet(&mut self, wallet: &EphemeralWallet) -> StoreResult<()>;

    /// Most recently created wallet for the user.
    async fn latest_wallet(&mut self, user_id: UserId) -> StoreResult<Option<EphemeralWallet>>;

    async fn get_payment(&mut self, tx_id: &str) -> StoreResult<Option<PaymentRecord>>;

    /// Insert a `pending` record unless the tx id exists. A rejection left by
    /// a different user is replaced. Returns whether a row was written.
    async fn insert_pending(&mut self, record: &PaymentRecord) -> StoreResult<bool>;

    /// Oldest pending records first.
    async fn pending_payments(&mut self, limit: usize) -> StoreResult<Vec<PaymentRecord>>;

    /// Atomically move `record.tx_id` to `confirmed`.
    ///
    /// Inserts the row if absent, upgrades it if it is `pending` and owned by
    /// `record.user_id`, or takes it over if another user's claim on it was
    /// rejected. Returns `false` when the tx id is already confirmed, pending
    /// for another user, or rejected for this user.
    async fn claim_confirmed(&mut self, record: &PaymentRecord) -> StoreResult<bool>;

    /// Persist a rejection of `record.tx_id` for `record.user_id`.
    ///
    /// Inserts a `rejected` row if the tx id is unknown, or downgrades a
    /// `pending` row owned by the same user. Rows owned by anyone else are
    /// left alone.
    async fn mark_rejected(&mut self, record: &PaymentRecord) -> StoreResult<bool>;

    async fn get_subscription(&mut self, user_id: UserId) -> StoreResult<Option<Subscription>>;

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()>;
}

/// A physical connection.
#[async_trait]
pub trait Connection: PaymentTables + Send + 'static {
    async fn begin(&mut self) -> StoreResult<()>;
    async fn commit(&mut self) -> StoreResult<()>;
    async fn rollback(&mut self) -> StoreResult<()>;

    /// Cheap round trip used by health probes.
    async fn ping(&mut self) -> StoreResult<()>;

    /// Whether the backend already knows the connection is dead.
    fn is_closed(&self) -> bool;
}
