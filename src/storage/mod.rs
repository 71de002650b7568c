// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Durable state for the payment core, reached through a small bounded
//! connection pool ([`ResilientStore`]).
//!
//! ## Tables
//!
//! ```text
//! ephemeral_wallets   one-time receiving addresses (private key encrypted)
//! payments            one row per network tx id; `confirmed` rows are the
//!                     double-spend index
//! subscriptions       paid window per user
//! ```
//!
//! ## Backends
//!
//! - [`postgres`]: production backend (`postgres://...`).
//! - [`memory`]: in-process backend for local runs and tests, with fault
//!   injection.
//!
//! Backends implement [`Connector`] / [`Connection`]; everything above this
//! module works through [`ResilientStore::with_transaction`].

pub mod connection;
pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;

pub use connection::{Connection, Connector, PaymentTables};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryConnector, MemoryDatabase};
pub use models::{EphemeralWallet, PaymentRecord, PaymentStatus, Subscription, UserId};
pub use pool::{ConnectionLease, PoolConfig, PoolStatus, ResilientStore, WorkFuture};
pub use postgres::PgConnector;
