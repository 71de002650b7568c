// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Health probes and the snapshot they produce.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::storage::ResilientStore;

pub const DEFAULT_NETWORK_PROBE_ADDR: &str = "8.8.8.8:53";
pub const DEFAULT_DISK_USAGE_THRESHOLD: f64 = 0.95;

/// Upper bound for a single probe; a probe that takes longer counts as failed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    Store,
    Network,
    Disk,
    Service,
}

impl HealthCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthCheck::Store => "store",
            HealthCheck::Network => "network",
            HealthCheck::Disk => "disk",
            HealthCheck::Service => "service",
        }
    }
}

/// Result of one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub checks: BTreeMap<HealthCheck, bool>,
}

impl HealthSnapshot {
    pub fn all_ok(&self) -> bool {
        self.checks.values().all(|ok| *ok)
    }

    pub fn failing(&self) -> Vec<HealthCheck> {
        self.checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(check, _)| *check)
            .collect()
    }

    /// One `name: OK|FAIL` line per check.
    pub fn report(&self) -> String {
        self.checks
            .iter()
            .map(|(check, ok)| format!("{}: {}", check.as_str(), if *ok { "OK" } else { "FAIL" }))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn check(&self) -> HealthCheck;

    /// `true` when healthy. Probes never error; failures are logged.
    async fn probe(&self) -> bool;
}

/// `SELECT 1` through the resilient store.
pub struct StoreProbe {
    store: Arc<ResilientStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<ResilientStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn check(&self) -> HealthCheck {
        HealthCheck::Store
    }

    async fn probe(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Store health check failed");
                false
            }
        }
    }
}

/// TCP reachability of a well-known address.
pub struct NetworkProbe {
    addr: String,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    fn check(&self) -> HealthCheck {
        HealthCheck::Network
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "Network health check failed");
                false
            }
            Err(_) => {
                warn!(addr = %self.addr, "Network health check timed out");
                false
            }
        }
    }
}

/// Filesystem usage below a threshold.
pub struct DiskProbe {
    path: PathBuf,
    threshold: f64,
}

impl DiskProbe {
    pub fn new(path: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            path: path.into(),
            threshold,
        }
    }
}

#[cfg(unix)]
fn usage_ratio(path: &std::path::Path) -> std::io::Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is NUL-terminated and `stat` is a plain C struct
    // fully written by a successful call.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        stat
    };

    let total = stat.f_blocks as f64;
    if total == 0.0 {
        return Ok(0.0);
    }
    Ok((total - stat.f_bavail as f64) / total)
}

#[cfg(not(unix))]
fn usage_ratio(_path: &std::path::Path) -> std::io::Result<f64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "disk usage probe requires statvfs",
    ))
}

#[async_trait]
impl HealthProbe for DiskProbe {
    fn check(&self) -> HealthCheck {
        HealthCheck::Disk
    }

    async fn probe(&self) -> bool {
        let path = self.path.clone();
        let ratio = match tokio::task::spawn_blocking(move || usage_ratio(&path)).await {
            Ok(Ok(ratio)) => ratio,
            Ok(Err(e)) => {
                warn!(path = %self.path.display(), error = %e, "Disk health check failed");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Disk health check task failed");
                return false;
            }
        };
        debug!(path = %self.path.display(), usage = ratio, "Disk usage");
        if ratio >= self.threshold {
            warn!(usage = ratio, threshold = self.threshold, "Disk usage above threshold");
            return false;
        }
        true
    }
}

/// `systemctl is-active <unit>` reports `active`.
pub struct ServiceProbe {
    unit: String,
}

impl ServiceProbe {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }
}

#[async_trait]
impl HealthProbe for ServiceProbe {
    fn check(&self) -> HealthCheck {
        HealthCheck::Service
    }

    async fn probe(&self) -> bool {
        match Command::new("systemctl")
            .args(["is-active", &self.unit])
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => {
                let state = String::from_utf8_lossy(&output.stdout);
                let active = state.trim() == "active";
                if !active {
                    warn!(unit = %self.unit, state = %state.trim(), "Service is not active");
                }
                active
            }
            Err(e) => {
                warn!(unit = %self.unit, error = %e, "Service health check failed");
                false
            }
        }
    }
}

/// The probes run on every cycle.
#[derive(Clone, Default)]
pub struct ProbeSet {
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Probe for one check, if registered.
    pub fn get(&self, check: HealthCheck) -> Option<Arc<dyn HealthProbe>> {
        self.probes.iter().find(|p| p.check() == check).cloned()
    }

    pub async fn run(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let mut checks = BTreeMap::new();
        for probe in &self.probes {
            let ok = tokio::time::timeout(PROBE_TIMEOUT, probe.probe())
                .await
                .unwrap_or_else(|_| {
                    warn!(check = probe.check().as_str(), "Health probe timed out");
                    false
                });
            checks.insert(probe.check(), ok);
        }
        HealthSnapshot {
            taken_at: now,
            checks,
        }
    }
}
