// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Recovery actions and the table that maps failing checks to them.
//!
//! Every action is narrow, takes no runtime parameters and is safe to run
//! more than once. Commands are spawned directly (never through a shell)
//! and killed when the caller's timeout drops them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::probes::HealthCheck;
use crate::storage::{ResilientStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> String;
    async fn run(&self) -> Result<(), RecoveryError>;
}

async fn run_command(program: &str, args: &[&str]) -> Result<(), RecoveryError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }
    Err(RecoveryError::Command {
        command: format!("{program} {}", args.join(" ")),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// `systemctl restart <unit>`.
pub struct RestartUnit {
    unit: String,
}

impl RestartUnit {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }
}

#[async_trait]
impl RecoveryAction for RestartUnit {
    fn name(&self) -> String {
        format!("restart {}", self.unit)
    }

    async fn run(&self) -> Result<(), RecoveryError> {
        run_command("systemctl", &["restart", &self.unit]).await
    }
}

/// Remove the contents of a scratch directory, keeping the directory.
pub struct ClearTempDir {
    dir: PathBuf,
}

impl ClearTempDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecoveryAction for ClearTempDir {
    fn name(&self) -> String {
        format!("clear {}", self.dir.display())
    }

    async fn run(&self) -> Result<(), RecoveryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Do not follow symlinks out of the directory.
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed += 1,
                // Entries in use by other processes are skipped.
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove temp entry"),
            }
        }
        info!(dir = %self.dir.display(), removed, "Temporary directory cleared");
        Ok(())
    }
}

/// `journalctl --vacuum-size=<size>`.
pub struct VacuumJournal {
    max_size: String,
}

impl Default for VacuumJournal {
    fn default() -> Self {
        Self {
            max_size: "100M".to_string(),
        }
    }
}

#[async_trait]
impl RecoveryAction for VacuumJournal {
    fn name(&self) -> String {
        format!("vacuum journal to {}", self.max_size)
    }

    async fn run(&self) -> Result<(), RecoveryError> {
        let arg = format!("--vacuum-size={}", self.max_size);
        run_command("journalctl", &[&arg]).await
    }
}

/// Drop every pooled connection and verify a fresh one.
pub struct RebuildPool {
    store: Arc<ResilientStore>,
}

impl RebuildPool {
    pub fn new(store: Arc<ResilientStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryAction for RebuildPool {
    fn name(&self) -> String {
        "rebuild connection pool".to_string()
    }

    async fn run(&self) -> Result<(), RecoveryError> {
        self.store.rebuild();
        self.store.ping().await?;
        Ok(())
    }
}

/// Outcome of one action.
#[derive(Debug)]
pub struct ActionOutcome {
    pub check: HealthCheck,
    pub action: String,
    pub result: Result<(), RecoveryError>,
}

/// Failing check → recovery actions, run in registration order.
#[derive(Clone)]
pub struct RecoveryPlan {
    actions: HashMap<HealthCheck, Vec<Arc<dyn RecoveryAction>>>,
    timeout: Duration,
}

impl Default for RecoveryPlan {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RecoveryPlan {
    pub fn new(timeout: Duration) -> Self {
        Self {
            actions: HashMap::new(),
            timeout,
        }
    }

    pub fn with_action(mut self, check: HealthCheck, action: Arc<dyn RecoveryAction>) -> Self {
        self.actions.entry(check).or_default().push(action);
        self
    }

    pub fn actions_for(&self, check: HealthCheck) -> &[Arc<dyn RecoveryAction>] {
        self.actions.get(&check).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run the actions for every failing check, each bounded by the timeout.
    pub async fn execute(&self, failing: &[HealthCheck]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        for &check in failing {
            for action in self.actions_for(check) {
                let name = action.name();
                info!(check = check.as_str(), action = %name, "Running recovery action");
                let result = tokio::time::timeout(self.timeout, action.run())
                    .await
                    .unwrap_or(Err(RecoveryError::Timeout(self.timeout)));
                if let Err(e) = &result {
                    warn!(check = check.as_str(), action = %name, error = %e, "Recovery action failed");
                }
                outcomes.push(ActionOutcome {
                    check,
                    action: name,
                    result,
                });
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryDatabase, PoolConfig};
    use crate::testing::CountingAction;

    #[tokio::test]
    async fn runs_only_actions_for_failing_checks() {
        let restart = CountingAction::new("restart");
        let clean = CountingAction::new("clean");
        let plan = RecoveryPlan::default()
            .with_action(HealthCheck::Service, restart.clone())
            .with_action(HealthCheck::Disk, clean.clone());

        let outcomes = plan.execute(&[HealthCheck::Disk]).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, "clean");
        assert!(outcomes[0].result.is_ok());
        assert_eq!(clean.runs(), 1);
        assert_eq!(restart.runs(), 0);

        assert!(plan.execute(&[HealthCheck::Network]).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_times_out() {
        let slow = CountingAction::new("slow").with_delay(Duration::from_secs(120));
        let plan = RecoveryPlan::new(Duration::from_secs(5)).with_action(HealthCheck::Store, slow);

        let outcomes = plan.execute(&[HealthCheck::Store]).await;
        assert!(matches!(outcomes[0].result, Err(RecoveryError::Timeout(_))));
    }

    /// Live processes whose command line contains `needle`. Killed children
    /// that are not yet reaped have an empty cmdline.
    #[cfg(target_os = "linux")]
    fn processes_matching(needle: &str) -> usize {
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
            .filter(|cmdline| String::from_utf8_lossy(cmdline).contains(needle))
            .count()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let result = tokio::time::timeout(
            Duration::from_millis(300),
            run_command("sleep", &["37.2914"]),
        )
        .await;
        assert!(result.is_err());

        let mut alive = processes_matching("37.2914");
        for _ in 0..40 {
            if alive == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = processes_matching("37.2914");
        }
        assert_eq!(alive, 0, "sleep outlived its timeout");
    }

    #[tokio::test]
    async fn clear_temp_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.tmp"), b"y").unwrap();

        let action = ClearTempDir::new(dir.path());
        action.run().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(dir.path().exists());

        action.run().await.unwrap();
        ClearTempDir::new(dir.path().join("missing")).run().await.unwrap();
    }

    #[tokio::test]
    async fn rebuild_pool_bumps_generation() {
        let db = MemoryDatabase::new();
        let store = Arc::new(ResilientStore::new(
            Arc::new(db.connector()),
            PoolConfig::default(),
        ));
        store.ping().await.unwrap();

        RebuildPool::new(Arc::clone(&store)).run().await.unwrap();
        assert_eq!(store.status().rebuilds, 1);
        assert_eq!(store.status().generation, 1);
    }
}
