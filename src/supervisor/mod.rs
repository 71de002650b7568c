// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Self-Healing Supervisor
//!
//! Probes the host every `interval` (default 300 s). When a check fails it
//! runs the recovery actions mapped to that check, probes once more and
//! sends the operator a before/after report.
//!
//! Components report runtime errors through [`ErrorSink`]. More than
//! `max_errors` reports inside one `error_window` trigger a full restart of
//! the service unit regardless of the last snapshot. After a restart the
//! supervisor waits `restart_settle`, re-checks the unit and alerts the
//! outcome.

pub mod notifier;
pub mod probes;
pub mod recovery;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::Metrics;
use crate::security::{AuditEvent, AuditEventType, AuditLog};

pub use notifier::{LogNotifier, Notifier, NotifyError, TelegramNotifier};
pub use probes::{
    DiskProbe, HealthCheck, HealthProbe, HealthSnapshot, NetworkProbe, ProbeSet, ServiceProbe,
    StoreProbe,
};
pub use recovery::{
    ClearTempDir, RebuildPool, RecoveryAction, RecoveryError, RecoveryPlan, RestartUnit,
    VacuumJournal,
};

/// Where components report runtime errors.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report_error(&self, error: &str);
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub max_errors: u32,
    pub error_window: Duration,
    /// Wait between a restart and its verification.
    pub restart_settle: Duration,
    pub restart_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_errors: 20,
            error_window: Duration::from_secs(3600),
            restart_settle: Duration::from_secs(15),
            restart_timeout: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    #[must_use]
    pub const fn with_error_window(mut self, window: Duration) -> Self {
        self.error_window = window;
        self
    }
}

/// Error counter that resets after a fixed window.
#[derive(Debug)]
pub struct ErrorBudget {
    max_errors: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl ErrorBudget {
    pub fn new(max_errors: u32, window: Duration) -> Self {
        Self {
            max_errors,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Count one error. Returns the running count and whether the budget is
    /// exceeded; an exceeded budget starts over.
    pub fn record(&mut self) -> (u32, bool) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        let count = self.count;
        if count > self.max_errors {
            self.count = 0;
            self.window_start = now;
            return (count, true);
        }
        (count, false)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

struct ServiceRestart {
    action: Arc<dyn RecoveryAction>,
    verify: Arc<dyn HealthProbe>,
}

pub struct Supervisor {
    probes: ProbeSet,
    plan: RecoveryPlan,
    notifier: Arc<dyn Notifier>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    budget: Mutex<ErrorBudget>,
    restart: Option<ServiceRestart>,
    restarting: AtomicBool,
    last: RwLock<Option<HealthSnapshot>>,
    metrics: Option<Arc<Metrics>>,
}

impl Supervisor {
    pub fn new(
        probes: ProbeSet,
        plan: RecoveryPlan,
        notifier: Arc<dyn Notifier>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self::with_config(probes, plan, notifier, audit, SupervisorConfig::default())
    }

    pub fn with_config(
        probes: ProbeSet,
        plan: RecoveryPlan,
        notifier: Arc<dyn Notifier>,
        audit: Arc<AuditLog>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            probes,
            plan,
            notifier,
            audit,
            clock: Arc::new(SystemClock),
            budget: Mutex::new(ErrorBudget::new(config.max_errors, config.error_window)),
            config,
            restart: None,
            restarting: AtomicBool::new(false),
            last: RwLock::new(None),
            metrics: None,
        }
    }

    /// How to restart the whole service, and how to tell that it came back.
    pub fn with_restart(
        mut self,
        action: Arc<dyn RecoveryAction>,
        verify: Arc<dyn HealthProbe>,
    ) -> Self {
        self.restart = Some(ServiceRestart { action, verify });
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, snapshot: &HealthSnapshot) {
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
    }

    /// Delivery failures are logged and go no further.
    async fn alert(&self, message: &str) {
        if let Err(e) = self.notifier.notify(message).await {
            warn!(error = %e, "Failed to deliver operator alert");
        }
    }

    /// Probe everything; recover and re-probe once if anything failed.
    pub async fn run_checks(&self) -> HealthSnapshot {
        let snapshot = self.probes.run(self.clock.now()).await;
        self.remember(&snapshot);
        if snapshot.all_ok() {
            return snapshot;
        }
        self.recover(snapshot).await
    }

    async fn recover(&self, before: HealthSnapshot) -> HealthSnapshot {
        let failing = before.failing();
        let names: Vec<&str> = failing.iter().map(|c| c.as_str()).collect();
        error!(failing = ?names, "Health check failed, attempting recovery");
        self.audit.log(
            AuditEvent::new(AuditEventType::RecoveryStarted).with_detail(names.join(",")),
        );
        self.alert(&format!("System recovery initiated. Failing: {}", names.join(", ")))
            .await;

        let outcomes = self.plan.execute(&failing).await;
        let failed_actions = outcomes.iter().filter(|o| o.result.is_err()).count();

        let after = self.probes.run(self.clock.now()).await;
        self.remember(&after);

        let mut event = AuditEvent::new(AuditEventType::RecoveryFinished).with_detail(format!(
            "actions={} failed_actions={failed_actions}",
            outcomes.len()
        ));
        if !after.all_ok() {
            event = event.failed();
        }
        self.audit.log(event);
        info!(
            recovered = after.all_ok(),
            actions = outcomes.len(),
            failed_actions,
            "Recovery finished"
        );
        self.alert(&format!(
            "Recovery results\n\nBefore:\n{}\n\nAfter:\n{}",
            before.report(),
            after.report()
        ))
        .await;
        after
    }

    /// Restart the service unit and verify it came back.
    ///
    /// Returns `false` if no restart is configured, one is already running,
    /// or the unit is not active afterwards.
    pub async fn restart_service(&self) -> bool {
        let Some(restart) = &self.restart else {
            warn!("Service restart requested but not configured");
            return false;
        };
        if self.restarting.swap(true, Ordering::AcqRel) {
            info!("Service restart already in progress");
            return false;
        }

        let result = tokio::time::timeout(self.config.restart_timeout, restart.action.run())
            .await
            .unwrap_or(Err(RecoveryError::Timeout(self.config.restart_timeout)));
        tokio::time::sleep(self.config.restart_settle).await;
        let active = restart.verify.probe().await;

        let ok = result.is_ok() && active;
        let mut event = AuditEvent::new(AuditEventType::ServiceRestart);
        match &result {
            Err(e) => {
                error!(error = %e, "Service restart failed");
                event = event.with_detail(e.to_string()).failed();
                self.alert(&format!("Service restart failed: {e}")).await;
            }
            Ok(()) if !active => {
                error!("Service not active after restart");
                event = event.with_detail("not active after restart").failed();
                self.alert("Service restart failed: unit is not active").await;
            }
            Ok(()) => {
                info!("Service restarted");
                self.alert("Service restarted successfully").await;
            }
        }
        self.audit.log(event);

        self.restarting.store(false, Ordering::Release);
        ok
    }

    /// Run probe cycles until the cancellation token is triggered.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Health supervisor starting"
        );

        loop {
            let snapshot = tokio::select! {
                snapshot = self.run_checks() => snapshot,
                _ = shutdown.cancelled() => break,
            };
            if !snapshot.all_ok() {
                warn!(report = %snapshot.report().replace('\n', ", "), "System still degraded");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {},
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Health supervisor shutting down");
    }
}

#[async_trait]
impl ErrorSink for Supervisor {
    async fn report_error(&self, error: &str) {
        let (count, exceeded) = self
            .budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record();
        if let Some(metrics) = &self.metrics {
            metrics.record_error();
        }
        self.audit.log(
            AuditEvent::new(AuditEventType::HealthError)
                .with_detail(format!("error #{count}: {error}"))
                .failed(),
        );

        if exceeded {
            error!(count, "Error threshold exceeded, restarting service");
            self.alert("Critical error threshold reached. Initiating restart.")
                .await;
            self.restart_service().await;
        }
    }
}
