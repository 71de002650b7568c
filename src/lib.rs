// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Subscription Guard - Payment Integrity & Self-Healing Core
//!
//! Backend core of the subscription bot: USDT plan payments are credited at
//! most once per transaction id, secrets stay encrypted in memory, database
//! access survives connection loss, and a supervisor probes and repairs the
//! host.
//!
//! ## Modules
//!
//! - `security` - Secret vault, field cipher, sealed settings, audit log, webhook signatures
//! - `storage` - Resilient connection pool over Postgres (or memory)
//! - `payments` - Plans, ledger client, integrity monitor and confirmation poller
//! - `resilience` - Circuit breaker and bounded backoff
//! - `supervisor` - Health probes, recovery actions, operator alerts
//! - `metrics` - Prometheus counters and pool gauges
//! - `api` - HTTP webhooks, internal payment API, health, metrics (Axum)

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod payments;
pub mod resilience;
pub mod security;
pub mod state;
pub mod storage;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;
