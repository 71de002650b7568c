// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared test doubles and fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::clock::ManualClock;
use crate::metrics::Metrics;
use crate::payments::{Amount, Ledger, LedgerDeposit, LedgerError, PaymentMonitor};
use crate::resilience::CircuitBreaker;
use crate::security::vault::MASTER_ENCRYPTION;
use crate::security::{AuditLog, CipherService, SealedSettings, SecretVault};
use crate::state::AppState;
use crate::storage::{MemoryDatabase, PoolConfig, ResilientStore};
use crate::supervisor::{
    ErrorSink, HealthCheck, HealthProbe, Notifier, NotifyError, ProbeSet, RecoveryAction,
    RecoveryError, RecoveryPlan, StoreProbe, Supervisor,
};

#[derive(Default)]
struct MockLedgerState {
    deposits: HashMap<String, LedgerDeposit>,
    failing: Vec<String>,
    calls: HashMap<String, u32>,
}

/// In-memory ledger with per-transaction failure injection.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
}

impl MockLedger {
    pub fn insert(&self, tx_id: &str, address: &str, amount: Amount, confirmations: u32) {
        self.lock().deposits.insert(
            tx_id.to_string(),
            LedgerDeposit {
                tx_id: tx_id.to_string(),
                asset: "USDT".to_string(),
                amount,
                address: address.to_string(),
                confirmations,
                inserted_at: None,
            },
        );
    }

    /// Make every lookup of `tx_id` fail with a request error.
    pub fn fail_for(&self, tx_id: &str) {
        self.lock().failing.push(tx_id.to_string());
    }

    pub fn calls(&self, tx_id: &str) -> u32 {
        self.lock().calls.get(tx_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockLedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn find_deposit(
        &self,
        asset: &str,
        tx_id: &str,
    ) -> Result<Option<LedgerDeposit>, LedgerError> {
        let mut state = self.lock();
        *state.calls.entry(tx_id.to_string()).or_default() += 1;
        if state.failing.iter().any(|t| t == tx_id) {
            return Err(LedgerError::Request("connection reset".into()));
        }
        Ok(state
            .deposits
            .get(tx_id)
            .filter(|d| d.asset == asset)
            .cloned())
    }
}

pub struct TestFixture {
    pub db: MemoryDatabase,
    pub store: Arc<ResilientStore>,
    pub ledger: Arc<MockLedger>,
    pub vault: Arc<SecretVault>,
    pub cipher: Arc<CipherService>,
    pub settings: Arc<SealedSettings>,
    pub audit: Arc<AuditLog>,
    pub clock: Arc<ManualClock>,
    pub monitor: Arc<PaymentMonitor>,
    pub metrics: Arc<Metrics>,
}

pub fn fixture() -> TestFixture {
    let db = MemoryDatabase::new();
    let store = Arc::new(ResilientStore::new(
        Arc::new(db.connector()),
        PoolConfig::default(),
    ));
    let ledger = Arc::new(MockLedger::default());

    let vault = Arc::new(SecretVault::new());
    vault.store(MASTER_ENCRYPTION, vec![7u8; 32]);
    let cipher = Arc::new(CipherService::new(Arc::clone(&vault)));
    let settings = Arc::new(SealedSettings::new(CipherService::new(Arc::clone(&vault))));
    let audit = Arc::new(AuditLog::new(b"test-salt".to_vec()));

    let start = Utc
        .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
        .single()
        .expect("valid start time");
    let clock = Arc::new(ManualClock::new(start));
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));

    let monitor = Arc::new(
        PaymentMonitor::new(
            Arc::clone(&store),
            ledger.clone(),
            Arc::clone(&cipher),
            Arc::clone(&audit),
        )
        .with_clock(clock.clone())
        .with_metrics(Arc::clone(&metrics)),
    );

    TestFixture {
        db,
        store,
        ledger,
        vault,
        cipher,
        settings,
        audit,
        clock,
        monitor,
        metrics,
    }
}

/// HTTP state over the fixture. The supervisor only probes the store.
pub fn app_state(fx: &TestFixture) -> AppState {
    let supervisor = Supervisor::new(
        ProbeSet::new().with_probe(Arc::new(StoreProbe::new(Arc::clone(&fx.store)))),
        RecoveryPlan::default(),
        Arc::new(RecordingNotifier::default()),
        Arc::clone(&fx.audit),
    )
    .with_metrics(Arc::clone(&fx.metrics));
    AppState {
        monitor: Arc::clone(&fx.monitor),
        settings: Arc::clone(&fx.settings),
        audit: Arc::clone(&fx.audit),
        breaker: Arc::new(CircuitBreaker::default()),
        supervisor: Arc::new(supervisor),
        store: Arc::clone(&fx.store),
        metrics: Arc::clone(&fx.metrics),
    }
}

/// Collects reported errors.
#[derive(Default)]
pub struct RecordingSink {
    errors: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ErrorSink for RecordingSink {
    async fn report_error(&self, error: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
    }
}

/// Collects alerts.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
        Ok(())
    }
}

/// Probe with a settable result.
pub struct StaticProbe {
    check: HealthCheck,
    healthy: AtomicBool,
    probes: AtomicU32,
}

impl StaticProbe {
    pub fn new(check: HealthCheck, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            check,
            healthy: AtomicBool::new(healthy),
            probes: AtomicU32::new(0),
        })
    }

    pub fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    fn check(&self) -> HealthCheck {
        self.check
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Recovery action that counts runs and can heal a probe.
pub struct CountingAction {
    name: String,
    runs: AtomicU32,
    delay: Mutex<Option<Duration>>,
    heals: Mutex<Option<Arc<StaticProbe>>>,
}

impl CountingAction {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            runs: AtomicU32::new(0),
            delay: Mutex::new(None),
            heals: Mutex::new(None),
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    pub fn healing(self: Arc<Self>, probe: Arc<StaticProbe>) -> Arc<Self> {
        *self.heals.lock().unwrap_or_else(PoisonError::into_inner) = Some(probe);
        self
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoveryAction for CountingAction {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), RecoveryError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let heals = self
            .heals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(probe) = heals {
            probe.set(true);
        }
        Ok(())
    }
}
