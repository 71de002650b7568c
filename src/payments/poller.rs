// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Confirmation Poller
//!
//! Background task that sweeps pending payments and confirms them against
//! the ledger, so credits land even when the user never asks for a manual
//! verification.
//!
//! ## Strategy
//!
//! Every `interval` (default 60 s) the poller runs one sweep
//! ([`PaymentMonitor::confirm_pending`]). A failed sweep is retried with
//! bounded exponential backoff (3 attempts, 2 s doubling to at most 10 s).
//! If every attempt fails the loop is reported as stalled to the
//! [`ErrorSink`] and the next sweep waits `error_interval` (default 300 s).
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`; cancellation is observed
//! between sweeps and during every sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::monitor::{PaymentError, PaymentMonitor, SweepSummary};
use crate::resilience::Backoff;
use crate::supervisor::ErrorSink;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub error_interval: Duration,
    pub backoff: Backoff,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            error_interval: Duration::from_secs(300),
            backoff: Backoff::default(),
        }
    }
}

/// Periodically confirms pending payments.
pub struct PaymentPoller {
    monitor: Arc<PaymentMonitor>,
    errors: Option<Arc<dyn ErrorSink>>,
    config: PollerConfig,
}

impl PaymentPoller {
    pub fn new(monitor: Arc<PaymentMonitor>) -> Self {
        Self {
            monitor,
            errors: None,
            config: PollerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where stalls are reported.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(sink);
        self
    }

    /// Run the poller loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(poller.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Payment poller starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.sweep_with_retry(&shutdown).await {
                Some(Ok(summary)) => {
                    log_summary(&summary);
                    self.config.interval
                }
                Some(Err(e)) => {
                    error!(error = %e, "Payment poller stalled");
                    if let Some(sink) = &self.errors {
                        sink.report_error(&format!("payment poller stalled: {e}"))
                            .await;
                    }
                    self.config.error_interval
                }
                None => break,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Payment poller shutting down");
    }

    /// One sweep with retries. `None` if cancelled while backing off.
    async fn sweep_with_retry(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<Result<SweepSummary, PaymentError>> {
        let mut attempt = 0;
        loop {
            match self.monitor.confirm_pending().await {
                Ok(summary) => return Some(Ok(summary)),
                Err(e) if self.config.backoff.should_retry(attempt) => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Payment sweep failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = shutdown.cancelled() => return None,
                    }
                    attempt += 1;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn log_summary(summary: &SweepSummary) {
    if summary.checked == 0 {
        debug!("No pending payments");
        return;
    }
    info!(
        checked = summary.checked,
        confirmed = summary.confirmed,
        rejected = summary.rejected,
        waiting = summary.waiting,
        failed = summary.failed,
        "Payment sweep complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::Amount;
    use crate::storage::PaymentStatus;
    use crate::testing::{fixture, RecordingSink};

    #[tokio::test(start_paused = true)]
    async fn confirms_pending_payment_and_stops_on_cancel() {
        let fx = fixture();
        let wallet = fx
            .monitor
            .generate_payment_address(1, Amount::whole(105))
            .await
            .unwrap();
        fx.monitor
            .record_intent(1, "tx1", Amount::whole(105), &wallet.address)
            .await
            .unwrap();
        fx.ledger.insert("tx1", &wallet.address, Amount::whole(105), 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(PaymentPoller::new(Arc::clone(&fx.monitor)).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.db.payment("tx1").await.unwrap().status, PaymentStatus::Confirmed);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reports_stall_after_retries() {
        let fx = fixture();
        let wallet = fx
            .monitor
            .generate_payment_address(1, Amount::whole(105))
            .await
            .unwrap();
        fx.monitor
            .record_intent(1, "tx1", Amount::whole(105), &wallet.address)
            .await
            .unwrap();
        fx.ledger.fail_for("tx1");

        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let poller = PaymentPoller::new(Arc::clone(&fx.monitor))
            .with_config(PollerConfig {
                backoff: Backoff::default().without_jitter(),
                ..PollerConfig::default()
            })
            .with_error_sink(sink.clone());
        let handle = tokio::spawn(poller.run(shutdown.clone()));

        // Attempts at t=0, 2 s and 6 s, then the stall report.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fx.ledger.calls("tx1"), 3);
        assert_eq!(sink.errors().len(), 1);
        assert!(sink.errors()[0].contains("stalled"));

        // Next sweep only after the error interval.
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(fx.ledger.calls("tx1"), 3);
        tokio::time::sleep(Duration::from_secs(110)).await;
        assert_eq!(fx.ledger.calls("tx1"), 6);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_exits_promptly() {
        let fx = fixture();
        let wallet = fx
            .monitor
            .generate_payment_address(1, Amount::whole(105))
            .await
            .unwrap();
        fx.monitor
            .record_intent(1, "tx1", Amount::whole(105), &wallet.address)
            .await
            .unwrap();
        fx.ledger.fail_for("tx1");

        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            PaymentPoller::new(Arc::clone(&fx.monitor))
                .with_error_sink(sink.clone())
                .run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(sink.errors().is_empty());
    }
}
