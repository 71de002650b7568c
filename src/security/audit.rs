// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit logging for security-sensitive operations.
//!
//! Wallet issuance, payment decisions, webhook outcomes and recovery runs
//! are recorded as [`AuditEvent`]s. Events are emitted on the `audit`
//! tracing target and, when a directory is configured, appended to a daily
//! JSONL file.
//!
//! User ids never appear in an event. The actor is stored as a keyed hash
//! (HMAC-SHA256 with the audit salt) truncated to [`ACTOR_HASH_LEN`] hex
//! characters.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::ToSchema;
use zeroize::Zeroizing;

use crate::storage::UserId;

/// Length of the truncated actor hash, in hex characters.
pub const ACTOR_HASH_LEN: usize = 12;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Lifecycle
    AppStart,
    AppShutdown,

    // Payment events
    WalletGenerated,
    WalletReused,
    PaymentIntentRecorded,
    PaymentConfirmed,
    PaymentRejected,
    DoubleSpendBlocked,

    // Webhook events
    WebhookAccepted,
    WebhookRejected,
    WebhookShed,

    // Supervisor events
    HealthError,
    RecoveryStarted,
    RecoveryFinished,
    ServiceRestart,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Hashed user id, or a fixed label such as `system`.
    pub actor: String,
    /// Resource affected (address, tx id, ...).
    pub resource_id: Option<String>,
    /// Resource type (wallet, payment, webhook, ...).
    pub resource_type: Option<String>,
    /// Free-form detail. Must not contain raw user identifiers.
    pub detail: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
}

impl AuditEvent {
    /// Create an event attributed to the service itself.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            actor: "system".to_string(),
            resource_id: None,
            resource_type: None,
            detail: None,
            success: true,
        }
    }

    /// Attribute the event to a non-personal label (e.g. `webhook:kofi`).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.actor = label.into();
        self
    }

    /// Set the resource.
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Mark as failed.
    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Writes audit events and hashes actor ids.
pub struct AuditLog {
    salt: Zeroizing<Vec<u8>>,
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(salt: impl Into<Vec<u8>>) -> Self {
        Self {
            salt: Zeroizing::new(salt.into()),
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Also append events to daily JSONL files under `dir`.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Keyed, truncated hash of a user id.
    pub fn hash_actor(&self, user_id: UserId) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match Hmac::<Sha256>::new_from_slice(&self.salt) {
            Ok(mac) => mac,
            Err(_) => return "0".repeat(ACTOR_HASH_LEN),
        };
        mac.update(user_id.to_string().as_bytes());
        let mut digest = hex::encode(mac.finalize().into_bytes());
        digest.truncate(ACTOR_HASH_LEN);
        digest
    }

    /// Start an event attributed to `user_id`.
    pub fn user_event(&self, event_type: AuditEventType, user_id: UserId) -> AuditEvent {
        AuditEvent::new(event_type).with_label(self.hash_actor(user_id))
    }

    /// Record an event. Write failures are logged, never propagated.
    pub fn log(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_id = %event.event_id,
            event_type = ?event.event_type,
            actor = %event.actor,
            resource_type = event.resource_type.as_deref().unwrap_or(""),
            resource_id = event.resource_id.as_deref().unwrap_or(""),
            detail = event.detail.as_deref().unwrap_or(""),
            success = event.success,
            "audit"
        );

        if let Some(dir) = &self.dir {
            if let Err(e) = self.append(dir, &event) {
                warn!(error = %e, "Failed to append audit event");
            }
        }
    }

    fn append(&self, dir: &Path, event: &AuditEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(dir)?;
        let path = events_file(dir, &event.timestamp.format("%Y-%m-%d").to_string());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    /// Read audit events for a specific date (`YYYY-MM-DD`).
    pub fn read_events(&self, date: &str) -> std::io::Result<Vec<AuditEvent>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let content = match fs::read_to_string(events_file(dir, date)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("dir", &self.dir).finish()
    }
}

fn events_file(dir: &Path, date: &str) -> PathBuf {
    dir.join(format!("audit-{date}.jsonl"))
}
