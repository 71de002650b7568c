// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PostgreSQL backend.
//!
//! ## Schema
//!
//! ```text
//! ephemeral_wallets  address PK, user_id, amount_micros, plan_days,
//!                    encrypted_key (hex ciphertext), created_at, expires_at
//! payments           tx_id PK, user_id, asset, amount_micros, address,
//!                    status (pending|confirmed|rejected), confirmations, observed_at
//! subscriptions      user_id PK, start_date, end_date, plan_days, payment_method
//! ```
//!
//! The `payments` primary key is the double-spend index: the upgrade to
//! `confirmed` is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE` that
//! only matches a pending row owned by the same user.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, warn};

use super::connection::{Connection, Connector, PaymentTables};
use super::error::{StoreError, StoreResult};
use super::models::{EphemeralWallet, PaymentRecord, PaymentStatus, Subscription, UserId};
use crate::payments::Amount;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ephemeral_wallets (
    address        TEXT PRIMARY KEY,
    user_id        BIGINT NOT NULL,
    amount_micros  BIGINT NOT NULL,
    plan_days      INTEGER NOT NULL,
    encrypted_key  TEXT NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL,
    expires_at     TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS ephemeral_wallets_user_idx
    ON ephemeral_wallets (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS payments (
    tx_id          TEXT PRIMARY KEY,
    user_id        BIGINT NOT NULL,
    asset          TEXT NOT NULL,
    amount_micros  BIGINT NOT NULL,
    address        TEXT NOT NULL,
    status         TEXT NOT NULL CHECK (status IN ('pending', 'confirmed', 'rejected')),
    confirmations  INTEGER NOT NULL DEFAULT 0,
    observed_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS payments_pending_idx
    ON payments (observed_at) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id        BIGINT PRIMARY KEY,
    start_date     TIMESTAMPTZ NOT NULL,
    end_date       TIMESTAMPTZ NOT NULL,
    plan_days      INTEGER NOT NULL,
    payment_method TEXT NOT NULL
);
"#;

/// Map a driver error onto the store taxonomy.
fn classify(err: tokio_postgres::Error) -> StoreError {
    if err.is_closed() {
        return StoreError::Connection(err.to_string());
    }
    match err.code() {
        Some(code)
            if code.code().starts_with("08")
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CRASH_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW =>
        {
            StoreError::Connection(err.to_string())
        }
        Some(code) if code.code().starts_with("23") => StoreError::Constraint(err.to_string()),
        Some(_) => StoreError::Query(err.to_string()),
        None => {
            let is_io = err
                .source()
                .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
            if is_io {
                StoreError::Connection(err.to_string())
            } else {
                StoreError::Query(err.to_string())
            }
        }
    }
}

/// Opens connections from a `postgres://` URL.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: Config,
}

impl PgConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> StoreResult<Self> {
        let mut config: Config = url
            .parse()
            .map_err(|e| StoreError::Query(format!("Invalid connection string: {e}")))?;
        config.connect_timeout(connect_timeout);
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> StoreResult<Box<dyn Connection>> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });
        debug!("PostgreSQL connection established");

        Ok(Box::new(PgConnection { client }))
    }
}

struct PgConnection {
    client: Client,
}

fn column<'a, T>(row: &'a Row, name: &str) -> StoreResult<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

fn non_negative(value: i32, name: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {name}")))
}

fn wallet_from_row(row: &Row) -> StoreResult<EphemeralWallet> {
    Ok(EphemeralWallet {
        address: column(row, "address")?,
        user_id: column(row, "user_id")?,
        amount: Amount::from_micros(column(row, "amount_micros")?),
        plan_days: non_negative(column(row, "plan_days")?, "plan_days")?,
        encrypted_key: column(row, "encrypted_key")?,
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
    })
}

fn payment_from_row(row: &Row) -> StoreResult<PaymentRecord> {
    let status: String = column(row, "status")?;
    Ok(PaymentRecord {
        tx_id: column(row, "tx_id")?,
        user_id: column(row, "user_id")?,
        asset: column(row, "asset")?,
        amount: Amount::from_micros(column(row, "amount_micros")?),
        address: column(row, "address")?,
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown payment status {status}")))?,
        confirmations: non_negative(column(row, "confirmations")?, "confirmations")?,
        observed_at: column(row, "observed_at")?,
    })
}

fn subscription_from_row(row: &Row) -> StoreResult<Subscription> {
    Ok(Subscription {
        user_id: column(row, "user_id")?,
        start_date: column(row, "start_date")?,
        end_date: column(row, "end_date")?,
        plan_days: non_negative(column(row, "plan_days")?, "plan_days")?,
        payment_method: column(row, "payment_method")?,
    })
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

const PAYMENT_COLUMNS: &str =
    "tx_id, user_id, asset, amount_micros, address, status, confirmations, observed_at";

#[async_trait]
impl PaymentTables for PgConnection {
    async fn ensure_schema(&mut self) -> StoreResult<()> {
        self.client.batch_execute(SCHEMA).await.map_err(classify)
    }

    async fn lock_user(&mut self, user_id: UserId) -> StoreResult<()> {
        self.client
            .execute("SELECT pg_advisory_xact_lock($1)", &[&user_id])
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn insert_wallet(&mut self, wallet: &EphemeralWallet) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO ephemeral_wallets
                    (address, user_id, amount_micros, plan_days, encrypted_key, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &wallet.address,
                    &wallet.user_id,
                    &wallet.amount.micros(),
                    &as_i32(wallet.plan_days),
                    &wallet.encrypted_key,
                    &wallet.created_at,
                    &wallet.expires_at,
                ],
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn latest_wallet(&mut self, user_id: UserId) -> StoreResult<Option<EphemeralWallet>> {
        let row = self
            .client
            .query_opt(
                r#"
                SELECT address, user_id, amount_micros, plan_days, encrypted_key, created_at, expires_at
                FROM ephemeral_wallets
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                &[&user_id],
            )
            .await
            .map_err(classify)?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn get_payment(&mut self, tx_id: &str) -> StoreResult<Option<PaymentRecord>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE tx_id = $1");
        let row = self
            .client
            .query_opt(&sql, &[&tx_id])
            .await
            .map_err(classify)?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn insert_pending(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let inserted = self
            .client
            .execute(
                r#"
                INSERT INTO payments
                    (tx_id, user_id, asset, amount_micros, address, status, confirmations, observed_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
                ON CONFLICT (tx_id) DO UPDATE
                SET status = 'pending',
                    user_id = EXCLUDED.user_id,
                    asset = EXCLUDED.asset,
                    amount_micros = EXCLUDED.amount_micros,
                    address = EXCLUDED.address,
                    confirmations = EXCLUDED.confirmations,
                    observed_at = EXCLUDED.observed_at
                WHERE payments.status = 'rejected' AND payments.user_id <> EXCLUDED.user_id
                "#,
                &[
                    &record.tx_id,
                    &record.user_id,
                    &record.asset,
                    &record.amount.micros(),
                    &record.address,
                    &as_i32(record.confirmations),
                    &record.observed_at,
                ],
            )
            .await
            .map_err(classify)?;
        Ok(inserted == 1)
    }

    async fn pending_payments(&mut self, limit: usize) -> StoreResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = 'pending' \
             ORDER BY observed_at ASC LIMIT $1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(&sql, &[&limit])
            .await
            .map_err(classify)?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn claim_confirmed(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let claimed = self
            .client
            .execute(
                r#"
                INSERT INTO payments
                    (tx_id, user_id, asset, amount_micros, address, status, confirmations, observed_at)
                VALUES ($1, $2, $3, $4, $5, 'confirmed', $6, $7)
                ON CONFLICT (tx_id) DO UPDATE
                SET status = 'confirmed',
                    user_id = EXCLUDED.user_id,
                    asset = EXCLUDED.asset,
                    amount_micros = EXCLUDED.amount_micros,
                    address = EXCLUDED.address,
                    confirmations = EXCLUDED.confirmations,
                    observed_at = EXCLUDED.observed_at
                WHERE (payments.status = 'pending' AND payments.user_id = EXCLUDED.user_id)
                   OR (payments.status = 'rejected' AND payments.user_id <> EXCLUDED.user_id)
                "#,
                &[
                    &record.tx_id,
                    &record.user_id,
                    &record.asset,
                    &record.amount.micros(),
                    &record.address,
                    &as_i32(record.confirmations),
                    &record.observed_at,
                ],
            )
            .await
            .map_err(classify)?;
        Ok(claimed == 1)
    }

    async fn mark_rejected(&mut self, record: &PaymentRecord) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"
                INSERT INTO payments
                    (tx_id, user_id, asset, amount_micros, address, status, confirmations, observed_at)
                VALUES ($1, $2, $3, $4, $5, 'rejected', $6, $7)
                ON CONFLICT (tx_id) DO UPDATE
                SET status = 'rejected'
                WHERE payments.status = 'pending' AND payments.user_id = EXCLUDED.user_id
                "#,
                &[
                    &record.tx_id,
                    &record.user_id,
                    &record.asset,
                    &record.amount.micros(),
                    &record.address,
                    &as_i32(record.confirmations),
                    &record.observed_at,
                ],
            )
            .await
            .map_err(classify)?;
        Ok(updated == 1)
    }

    async fn get_subscription(&mut self, user_id: UserId) -> StoreResult<Option<Subscription>> {
        let row = self
            .client
            .query_opt(
                r#"
                SELECT user_id, start_date, end_date, plan_days, payment_method
                FROM subscriptions WHERE user_id = $1
                "#,
                &[&user_id],
            )
            .await
            .map_err(classify)?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO subscriptions (user_id, start_date, end_date, plan_days, payment_method)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id) DO UPDATE
                SET start_date = EXCLUDED.start_date,
                    end_date = EXCLUDED.end_date,
                    plan_days = EXCLUDED.plan_days,
                    payment_method = EXCLUDED.payment_method
                "#,
                &[
                    &subscription.user_id,
                    &subscription.start_date,
                    &subscription.end_date,
                    &as_i32(subscription.plan_days),
                    &subscription.payment_method,
                ],
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn begin(&mut self) -> StoreResult<()> {
        self.client.batch_execute("BEGIN").await.map_err(classify)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.client.batch_execute("COMMIT").await.map_err(classify)
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.client.batch_execute("ROLLBACK").await.map_err(classify)
    }

    async fn ping(&mut self) -> StoreResult<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(classify)
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}
