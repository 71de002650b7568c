// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Prometheus metrics.
//!
//! One [`Metrics`] owns its own registry, built by the process root and
//! shared with the monitor, the supervisor and the HTTP layer. Pool gauges
//! are sampled when the registry is rendered.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::storage::PoolStatus;

const NAMESPACE: &str = "subscription_guard";

pub struct Metrics {
    registry: Registry,
    payments_credited: IntCounterVec,
    webhooks: IntCounterVec,
    errors_reported: IntCounter,
    db_connections_in_use: IntGauge,
    db_connections_capacity: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let payments_credited = IntCounterVec::new(
            Opts::new("payments_credited_total", "Payments credited to a subscription")
                .namespace(NAMESPACE),
            &["method"],
        )?;
        registry.register(Box::new(payments_credited.clone()))?;

        let webhooks = IntCounterVec::new(
            Opts::new("webhooks_total", "Webhook deliveries by provider and outcome")
                .namespace(NAMESPACE),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(webhooks.clone()))?;

        let errors_reported = IntCounter::with_opts(
            Opts::new("errors_reported_total", "Runtime errors reported to the supervisor")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(errors_reported.clone()))?;

        let db_connections_in_use = IntGauge::with_opts(
            Opts::new("db_connections_in_use", "Database connections currently leased")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(db_connections_in_use.clone()))?;

        let db_connections_capacity = IntGauge::with_opts(
            Opts::new("db_connections_capacity", "Maximum pooled database connections")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(db_connections_capacity.clone()))?;

        Ok(Self {
            registry,
            payments_credited,
            webhooks,
            errors_reported,
            db_connections_in_use,
            db_connections_capacity,
        })
    }

    /// A payment credited through `method` ("binance", "kofi", ...).
    pub fn record_credit(&self, method: &str) {
        self.payments_credited.with_label_values(&[method]).inc();
    }

    pub fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhooks.with_label_values(&[provider, outcome]).inc();
    }

    pub fn record_error(&self) {
        self.errors_reported.inc();
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Text exposition of every metric, with pool gauges taken from `pool`.
    pub fn render(&self, pool: &PoolStatus) -> Result<String, prometheus::Error> {
        self.db_connections_in_use.set(gauge(pool.in_use));
        self.db_connections_capacity.set(gauge(pool.capacity));

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(in_use: usize) -> PoolStatus {
        PoolStatus {
            capacity: 10,
            in_use,
            idle: 10 - in_use,
            generation: 0,
            rebuilds: 0,
        }
    }

    #[test]
    fn renders_counters_by_label() {
        let metrics = Metrics::new().unwrap();
        metrics.record_credit("binance");
        metrics.record_credit("binance");
        metrics.record_webhook("kofi", "accepted");
        metrics.record_error();

        let text = metrics.render(&pool(3)).unwrap();
        assert!(text.contains("subscription_guard_payments_credited_total{method=\"binance\"} 2"));
        assert!(text.contains(
            "subscription_guard_webhooks_total{outcome=\"accepted\",provider=\"kofi\"} 1"
        ));
        assert!(text.contains("subscription_guard_errors_reported_total 1"));
        assert!(text.contains("subscription_guard_db_connections_in_use 3"));
        assert!(text.contains("subscription_guard_db_connections_capacity 10"));
    }

    #[test]
    fn pool_gauges_follow_latest_sample() {
        let metrics = Metrics::new().unwrap();
        metrics.render(&pool(7)).unwrap();
        let text = metrics.render(&pool(1)).unwrap();
        assert!(text.contains("subscription_guard_db_connections_in_use 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_error();
        let text = b.render(&pool(0)).unwrap();
        assert!(text.contains("subscription_guard_errors_reported_total 0"));
    }
}
