// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::metrics::Metrics;
use crate::payments::PaymentMonitor;
use crate::resilience::CircuitBreaker;
use crate::security::{AuditLog, SealedSettings};
use crate::storage::ResilientStore;
use crate::supervisor::Supervisor;

/// Shared handles for the HTTP handlers. Every component is built once by
/// the process root and injected here.
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<PaymentMonitor>,
    pub settings: Arc<SealedSettings>,
    pub audit: Arc<AuditLog>,
    pub breaker: Arc<CircuitBreaker>,
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<ResilientStore>,
    pub metrics: Arc<Metrics>,
}
