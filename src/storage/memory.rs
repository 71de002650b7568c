// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process storage backend.
//!
//! Used for local runs (`DATABASE_URL=memory://`) and as the store in unit
//! tests. Transactions are fully serialized: `BEGIN` takes the database
//! lock and works on a copy of the tables, `COMMIT` writes the copy back.
//!
//! Faults can be injected to exercise the pool's reconnect path:
//! [`MemoryDatabase::fail_next_connects`] and
//! [`MemoryDatabase::drop_next_operations`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::connection::{Connection, Connector, PaymentTables};
use super::error::{StoreError, StoreResult};
use super::models::{EphemeralWallet, PaymentRecord, PaymentStatus, Subscription, UserId};

#[derive(Debug, Default, Clone)]
struct Tables {
    wallets: Vec<EphemeralWallet>,
    payments: BTreeMap<String, PaymentRecord>,
    subscriptions: HashMap<UserId, Subscription>,
}

#[derive(Debug, Default)]
struct Counters {
    fail_connects: AtomicU32,
    drop_operations: AtomicU32,
    connects: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
    counters: Arc<Counters>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    /// The next `n` connection attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.counters.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` table operations fail with a connection error and
    /// leave their connection closed.
    pub fn drop_next_operations(&self, n: u32) {
        self.counters.drop_operations.store(n, Ordering::SeqCst);
    }

    /// Successful connection attempts so far.
    pub fn connects(&self) -> u32 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// Committed state of one payment.
    pub async fn payment(&self, tx_id: &str) -> Option<PaymentRecord> {
        self.tables.lock().await.payments.get(tx_id).cloned()
    }

    pub async fn payments(&self) -> Vec<PaymentRecord> {
        self.tables.lock().await.payments.values().cloned().collect()
    }

    pub async fn subscription(&self, user_id: UserId) -> Option<Subscription> {
        self.tables.lock().await.subscriptions.get(&user_id).cloned()
    }

    pub async fn wallets(&self) -> Vec<EphemeralWallet> {
        self.tables.lock().await.wallets.clone()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    db: MemoryDatabase,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> StoreResult<Box<dyn Connection>> {
        if take_one(&self.db.counters.fail_connects) {
            return Err(StoreError::Connection("connection refused".into()));
        }
        self.db.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            txn: None,
            closed: false,
        }))
    }
}

struct Txn {
    committed: OwnedMutexGuard<Tables>,
    working: Tables,
}

struct MemoryConnection {
    db: MemoryDatabase,
    txn: Option<Txn>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Connection("connection is closed".into()));
        }
        Ok(())
    }

    fn tables(&mut self) -> StoreResult<&mut Tables> {
        self.ensure_open()?;
        if take_one(&self.db.counters.drop_operations) {
            self.closed = true;
            return Err(StoreError::Connection("server closed the connection".into()));
        }
        match self.txn.as_mut() {
            Some(txn) => Ok(&mut txn.working),
            None => Err(StoreError::Query("no transaction in progress".into())),
        }
    }
}

#[async_trait]
impl PaymentTables for MemoryConnection {
    async fn ensure_schema(&mut self) -> StoreResult<()> {
        self.tables().map(|_| ())
    }

    async fn lock_user(&mut self, _user_id: UserId) -> StoreResult<()> {
        // Transactions are already serialized.
        self.tables().map(|_| ())
    }

    async fn insert_wallet(&mut self, wallet: &EphemeralWallet) -> StoreResult<()> {
        let tables = self.tables()?;
        if tables.wallets.iter().any(|w| w.address == wallet.address) {
            return Err(StoreError::Constraint(format!(
                "duplicate wallet address {}",
                wallet.address
            )));
        }
        tables.wallets.push(wallet.clone());
        Ok(())
    }

    async fn latest_wallet(&mut self, user_id: UserId) -> StoreResult<Option<EphemeralWallet>> {
        let tables = self.tables()?;
        Ok(tables
            .wallets
            .iter()
            .filter(|w| w.user_id == user_id)
            .max_by_key(|w| w.created_at)
            .cloned())
    }

    async fn get_payment(&mut self, tx_id: &str) -> StoreResult<Option<PaymentRecord>> {
        Ok(self.tables()?.payments.get(tx_id).cloned())
    }

    async fn insert_pending(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let tables = self.tables()?;
        if let Some(existing) = tables.payments.get(&record.tx_id) {
            let foreign_rejection =
                existing.status == PaymentStatus::Rejected && existing.user_id != record.user_id;
            if !foreign_rejection {
                return Ok(false);
            }
        }
        let mut pending = record.clone();
        pending.status = PaymentStatus::Pending;
        tables.payments.insert(pending.tx_id.clone(), pending);
        Ok(true)
    }

    async fn pending_payments(&mut self, limit: usize) -> StoreResult<Vec<PaymentRecord>> {
        let tables = self.tables()?;
        let mut pending: Vec<PaymentRecord> = tables
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.observed_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_confirmed(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let tables = self.tables()?;
        let mut confirmed = record.clone();
        confirmed.status = PaymentStatus::Confirmed;

        match tables.payments.get_mut(&record.tx_id) {
            None => {
                tables.payments.insert(confirmed.tx_id.clone(), confirmed);
                Ok(true)
            }
            Some(existing)
                if (existing.status == PaymentStatus::Pending
                    && existing.user_id == record.user_id)
                    || (existing.status == PaymentStatus::Rejected
                        && existing.user_id != record.user_id) =>
            {
                *existing = confirmed;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn mark_rejected(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let tables = self.tables()?;
        match tables.payments.get_mut(&record.tx_id) {
            None => {
                let mut rejected = record.clone();
                rejected.status = PaymentStatus::Rejected;
                tables.payments.insert(rejected.tx_id.clone(), rejected);
                Ok(true)
            }
            Some(existing)
                if existing.status == PaymentStatus::Pending
                    && existing.user_id == record.user_id =>
            {
                existing.status = PaymentStatus::Rejected;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn get_subscription(&mut self, user_id: UserId) -> StoreResult<Option<Subscription>> {
        Ok(self.tables()?.subscriptions.get(&user_id).cloned())
    }

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        self.tables()?
            .subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.txn.is_some() {
            return Err(StoreError::Query("transaction already in progress".into()));
        }
        let committed = Arc::clone(&self.db.tables).lock_owned().await;
        let working = committed.clone();
        self.txn = Some(Txn { committed, working });
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        match self.txn.take() {
            Some(mut txn) => {
                *txn.committed = txn.working;
                self.db.counters.commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::Query("no transaction in progress".into())),
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.txn.take().is_some() {
            self.db.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn ping(&mut self) -> StoreResult<()> {
        self.ensure_open()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::Amount;
    use chrono::{Duration, Utc};

    async fn open(db: &MemoryDatabase) -> Box<dyn Connection> {
        db.connector().connect().await.unwrap()
    }

    fn record(tx_id: &str, user_id: UserId) -> PaymentRecord {
        PaymentRecord::pending(tx_id, user_id, "USDT", Amount::whole(105), "Taddr", Utc::now())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();
        conn.insert_pending(&record("tx1", 1)).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(db.payment("tx1").await.is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();

        assert!(conn.claim_confirmed(&record("tx1", 1)).await.unwrap());
        assert!(!conn.claim_confirmed(&record("tx1", 1)).await.unwrap());
        assert!(!conn.claim_confirmed(&record("tx1", 2)).await.unwrap());
        conn.commit().await.unwrap();

        let stored = db.payment("tx1").await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Confirmed);
        assert_eq!(stored.user_id, 1);
    }

    #[tokio::test]
    async fn pending_record_is_claimed_only_by_owner() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();
        assert!(conn.insert_pending(&record("tx1", 1)).await.unwrap());
        assert!(!conn.insert_pending(&record("tx1", 2)).await.unwrap());

        assert!(!conn.claim_confirmed(&record("tx1", 2)).await.unwrap());
        assert!(!conn.mark_rejected(&record("tx1", 2)).await.unwrap());
        assert!(conn.claim_confirmed(&record("tx1", 1)).await.unwrap());
        assert!(!conn.mark_rejected(&record("tx1", 1)).await.unwrap());
        conn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rejection_binds_only_its_user() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();

        assert!(conn.mark_rejected(&record("tx1", 2)).await.unwrap());
        assert!(!conn.mark_rejected(&record("tx1", 2)).await.unwrap());
        assert!(!conn.claim_confirmed(&record("tx1", 2)).await.unwrap());
        assert!(!conn.insert_pending(&record("tx1", 2)).await.unwrap());

        // The real owner can still register and claim it.
        assert!(conn.insert_pending(&record("tx1", 1)).await.unwrap());
        assert!(conn.claim_confirmed(&record("tx1", 1)).await.unwrap());
        conn.commit().await.unwrap();

        let stored = db.payment("tx1").await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Confirmed);
        assert_eq!(stored.user_id, 1);
    }

    #[tokio::test]
    async fn latest_wallet_and_pending_order() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();

        let now = Utc::now();
        for (i, address) in ["Tone", "Ttwo"].iter().enumerate() {
            conn.insert_wallet(&EphemeralWallet {
                address: address.to_string(),
                user_id: 9,
                amount: Amount::whole(105),
                plan_days: 30,
                encrypted_key: String::new(),
                created_at: now + Duration::seconds(i as i64),
                expires_at: now + Duration::minutes(30),
            })
            .await
            .unwrap();
        }
        assert_eq!(conn.latest_wallet(9).await.unwrap().unwrap().address, "Ttwo");
        assert!(conn.latest_wallet(10).await.unwrap().is_none());

        let mut late = record("late", 1);
        late.observed_at = now + Duration::seconds(5);
        conn.insert_pending(&late).await.unwrap();
        let mut early = record("early", 1);
        early.observed_at = now;
        conn.insert_pending(&early).await.unwrap();

        let pending = conn.pending_payments(10).await.unwrap();
        assert_eq!(pending[0].tx_id, "early");
        assert_eq!(conn.pending_payments(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_drop_closes_connection() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        conn.begin().await.unwrap();
        db.drop_next_operations(1);

        let err = conn.get_payment("tx").await.unwrap_err();
        assert!(err.is_connection());
        assert!(conn.is_closed());
        assert!(conn.ping().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn operations_require_transaction() {
        let db = MemoryDatabase::new();
        let mut conn = open(&db).await;
        assert!(matches!(
            conn.get_payment("tx").await,
            Err(StoreError::Query(_))
        ));
    }
}
