// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! USDT subscription payments: plan prices, ledger lookups, the integrity
//! monitor that credits transactions exactly once, and its poll loop.

pub mod amount;
pub mod ledger;
pub mod monitor;
pub mod plans;
pub mod poller;

pub use amount::{Amount, AmountError};
pub use ledger::{BinanceLedger, Ledger, LedgerDeposit, LedgerError, DEFAULT_API_BASE_URL};
pub use monitor::{
    IssuedWallet, MonitorConfig, PaymentDecision, PaymentError, PaymentMonitor, RejectReason,
    SweepSummary,
};
pub use plans::{Plan, PlanCatalog};
pub use poller::{PaymentPoller, PollerConfig};
