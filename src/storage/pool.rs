// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bounded connection pool with transactional units of work.
//!
//! ## Guarantees
//!
//! - At most `capacity` leases are outstanding; further callers wait for a
//!   permit, or fail with [`StoreError::AcquireTimeout`] when a timeout is
//!   configured.
//! - A lease returns its connection exactly once, on drop, including on
//!   error and cancellation paths. Connections that are broken, closed or
//!   still inside a transaction are discarded instead of reused.
//! - [`ResilientStore::with_transaction`] commits on success and rolls back
//!   on error. A connection-level failure rebuilds the pool and re-runs the
//!   unit of work once; a second connection-level failure is returned as
//!   [`StoreError::Unavailable`]. Query and constraint errors are never
//!   retried.
//! - A connection lost during `COMMIT` leaves the outcome unknown, so it is
//!   reported as [`StoreError::Unavailable`] and not retried.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::connection::{Connection, Connector};
use super::error::{StoreError, StoreResult};

/// Future returned by a unit of work.
pub type WorkFuture<'c, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'c>>;

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    /// How long to wait for a free lease. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct PoolStatus {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
    pub generation: u64,
    pub rebuilds: u64,
}

struct IdleSet {
    conns: Vec<Box<dyn Connection>>,
    generation: u64,
}

/// Connection pool that survives transient database outages.
pub struct ResilientStore {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Semaphore,
    idle: Mutex<IdleSet>,
    rebuilds: AtomicU64,
}

impl ResilientStore {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            connector,
            config: PoolConfig { capacity, ..config },
            permits: Semaphore::new(capacity),
            idle: Mutex::new(IdleSet {
                conns: Vec::with_capacity(capacity),
                generation: 0,
            }),
            rebuilds: AtomicU64::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, IdleSet> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the payment tables if needed.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.with_transaction(|conn| Box::pin(async move { conn.ensure_schema().await }))
            .await?;
        info!(capacity = self.config.capacity, "Database schema ready");
        Ok(())
    }

    /// Take a lease on one connection.
    pub async fn acquire(&self) -> StoreResult<ConnectionLease<'_>> {
        let permit = match self.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.permits.acquire())
                .await
                .map_err(|_| StoreError::AcquireTimeout(limit))?,
            None => self.permits.acquire().await,
        }
        .map_err(|_| StoreError::PoolClosed)?;

        let (reused, generation) = {
            let mut idle = self.idle();
            (idle.conns.pop(), idle.generation)
        };
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!(generation, "Opening new database connection");
                self.connector.connect().await?
            }
        };

        Ok(ConnectionLease {
            store: self,
            conn: Some(conn),
            generation,
            broken: false,
            in_transaction: false,
            acquired_at: Instant::now(),
            _permit: permit,
        })
    }

    fn release(&self, conn: Box<dyn Connection>, generation: u64, reusable: bool) {
        if !reusable || conn.is_closed() {
            debug!(generation, "Discarding database connection");
            return;
        }
        let mut idle = self.idle();
        if idle.generation == generation && idle.conns.len() < self.config.capacity {
            idle.conns.push(conn);
        }
    }

    /// Drop every idle connection and invalidate outstanding ones.
    ///
    /// Leases taken before the rebuild are discarded when they return.
    pub fn rebuild(&self) {
        let stale = {
            let mut idle = self.idle();
            idle.generation += 1;
            std::mem::take(&mut idle.conns)
        };
        let count = self.rebuilds.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            dropped_idle = stale.len(),
            rebuilds = count,
            "Rebuilding database connection pool"
        );
    }

    /// Refuse new leases and drop idle connections.
    pub fn close(&self) {
        self.permits.close();
        let stale = std::mem::take(&mut self.idle().conns);
        info!(dropped_idle = stale.len(), "Database connection pool closed");
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.idle();
        PoolStatus {
            capacity: self.config.capacity,
            in_use: self
                .config
                .capacity
                .saturating_sub(self.permits.available_permits()),
            idle: idle.conns.len(),
            generation: idle.generation,
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }

    /// Round trip to the database on a pooled connection.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut lease = self.acquire().await?;
        let result = lease.conn()?.ping().await;
        if matches!(&result, Err(e) if e.is_connection()) {
            lease.broken = true;
        }
        result
    }

    /// Run `work` inside a transaction.
    ///
    /// `work` may be invoked twice (see the module docs), so it must only
    /// capture data it can reuse, typically by cloning into its future.
    pub async fn with_transaction<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut (dyn Connection + 'static)) -> WorkFuture<'c, T> + Send + Sync,
    {
        match self.run_once(&work).await {
            Err(e) if e.is_connection() => {
                warn!(error = %e, "Connection lost during transaction, retrying once");
                self.rebuild();
                match self.run_once(&work).await {
                    Err(e) if e.is_connection() => {
                        error!(error = %e, "Retry after pool rebuild failed");
                        Err(StoreError::Unavailable(e.to_string()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn run_once<T, F>(&self, work: &F) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut (dyn Connection + 'static)) -> WorkFuture<'c, T> + Send + Sync,
    {
        let mut lease = self.acquire().await?;
        lease.begin().await?;

        let outcome = {
            let conn = lease.conn()?;
            work(conn).await
        };

        match outcome {
            Ok(value) => match lease.commit().await {
                Ok(()) => Ok(value),
                Err(e) if e.is_connection() => Err(StoreError::Unavailable(format!(
                    "commit outcome unknown: {e}"
                ))),
                Err(e) => Err(e),
            },
            Err(e) => {
                if e.is_connection() {
                    lease.broken = true;
                }
                lease.rollback().await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ResilientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStore")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive use of one pooled connection.
pub struct ConnectionLease<'a> {
    store: &'a ResilientStore,
    conn: Option<Box<dyn Connection>>,
    generation: u64,
    broken: bool,
    in_transaction: bool,
    acquired_at: Instant,
    _permit: SemaphorePermit<'a>,
}

impl ConnectionLease<'_> {
    pub fn conn(&mut self) -> StoreResult<&mut (dyn Connection + 'static)> {
        self.conn.as_deref_mut().ok_or(StoreError::PoolClosed)
    }

    pub async fn begin(&mut self) -> StoreResult<()> {
        let result = self.conn()?.begin().await;
        match &result {
            Ok(()) => self.in_transaction = true,
            Err(e) if e.is_connection() => self.broken = true,
            Err(_) => {}
        }
        result
    }

    pub async fn commit(&mut self) -> StoreResult<()> {
        let result = self.conn()?.commit().await;
        match &result {
            Ok(()) => self.in_transaction = false,
            Err(_) => self.broken = true,
        }
        result
    }

    /// Roll back, logging rather than returning any failure.
    pub async fn rollback(&mut self) {
        if !self.in_transaction {
            return;
        }
        let result = match self.conn() {
            Ok(conn) => conn.rollback().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.in_transaction = false,
            Err(e) => {
                warn!(error = %e, "Rollback failed, discarding connection");
                self.broken = true;
            }
        }
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = !self.broken && !self.in_transaction;
            debug!(held_ms = self.held_for().as_millis() as u64, reusable, "Lease returned");
            self.store.release(conn, self.generation, reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::Amount;
    use crate::storage::memory::MemoryDatabase;
    use crate::storage::models::{PaymentRecord, PaymentStatus};
    use chrono::Utc;

    fn store(db: &MemoryDatabase, capacity: usize) -> ResilientStore {
        ResilientStore::new(
            Arc::new(db.connector()),
            PoolConfig::default().with_capacity(capacity),
        )
    }

    fn record(tx_id: &str) -> PaymentRecord {
        PaymentRecord::pending(tx_id, 7, "USDT", Amount::whole(105), "Taddr", Utc::now())
    }

    #[tokio::test]
    async fn commits_on_success() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);

        let inserted = store
            .with_transaction(|conn| {
                Box::pin(async move { conn.insert_pending(&record("tx1")).await })
            })
            .await
            .unwrap();

        assert!(inserted);
        assert_eq!(db.payment("tx1").await.unwrap().status, PaymentStatus::Pending);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn rolls_back_partial_writes() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);

        let result: StoreResult<()> = store
            .with_transaction(|conn| {
                Box::pin(async move {
                    conn.insert_pending(&record("tx1")).await?;
                    Err(StoreError::Query("boom".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(StoreError::Query(_))));
        assert!(db.payment("tx1").await.is_none());
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn logic_errors_are_not_retried() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);
        let calls = AtomicU64::new(0);

        let result: StoreResult<()> = store
            .with_transaction(|_conn| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err(StoreError::Constraint("dup".into())) })
            })
            .await;

        assert!(matches!(result, Err(StoreError::Constraint(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.status().rebuilds, 0);
    }

    #[tokio::test]
    async fn single_connection_drop_is_retried_once() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);
        let calls = AtomicU64::new(0);

        // Warm the pool so the retry has to replace a stale connection.
        store.ping().await.unwrap();
        db.drop_next_operations(1);

        let inserted = store
            .with_transaction(|conn| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { conn.insert_pending(&record("tx1")).await })
            })
            .await
            .unwrap();

        assert!(inserted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.status().rebuilds, 1);
        assert_eq!(db.payments().await.len(), 1);
    }

    #[tokio::test]
    async fn second_connection_drop_is_fatal() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);
        db.drop_next_operations(2);

        let result = store
            .with_transaction(|conn| {
                Box::pin(async move { conn.insert_pending(&record("tx1")).await })
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(db.payment("tx1").await.is_none());
    }

    #[tokio::test]
    async fn failed_connect_is_retried() {
        let db = MemoryDatabase::new();
        let store = store(&db, 1);
        db.fail_next_connects(1);

        store
            .with_transaction(|conn| Box::pin(async move { conn.ping().await }))
            .await
            .unwrap();
        assert_eq!(db.connects(), 1);
    }

    #[tokio::test]
    async fn leases_are_returned_and_reused() {
        let db = MemoryDatabase::new();
        let store = store(&db, 1);

        for _ in 0..5 {
            store.ping().await.unwrap();
        }
        let status = store.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 1);
        assert_eq!(db.connects(), 1);
    }

    #[tokio::test]
    async fn leases_are_returned_on_error() {
        let db = MemoryDatabase::new();
        let store = store(&db, 1);

        for _ in 0..3 {
            let _: StoreResult<()> = store
                .with_transaction(|_conn| {
                    Box::pin(async move { Err(StoreError::Query("nope".into())) })
                })
                .await;
        }
        assert_eq!(store.status().in_use, 0);
        store.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_exhausted() {
        let db = MemoryDatabase::new();
        let store = ResilientStore::new(
            Arc::new(db.connector()),
            PoolConfig::default()
                .with_capacity(1)
                .with_acquire_timeout(Some(Duration::from_secs(2))),
        );

        let held = store.acquire().await.unwrap();
        let err = store.acquire().await.err().unwrap();
        assert!(matches!(err, StoreError::AcquireTimeout(_)));

        drop(held);
        assert!(store.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let db = MemoryDatabase::new();
        let store = store(&db, 1);
        store.close();
        assert!(matches!(store.ping().await, Err(StoreError::PoolClosed)));
    }

    #[tokio::test]
    async fn stale_lease_is_discarded_after_rebuild() {
        let db = MemoryDatabase::new();
        let store = store(&db, 2);

        let lease = store.acquire().await.unwrap();
        store.rebuild();
        drop(lease);

        assert_eq!(store.status().idle, 0);
        assert_eq!(store.status().generation, 1);
    }
}
