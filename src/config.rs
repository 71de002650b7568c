// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read once from the environment at startup. Sensitive
//! values are held in [`Zeroizing`] buffers only until the process root
//! seals them (see [`crate::security::SealedSettings`]).
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATABASE_URL` | Postgres URL, or `memory://` for the in-process store | Required |
//! | `DB_POOL_SIZE` | Connection pool capacity | `5` |
//! | `DB_ACQUIRE_TIMEOUT_SECS` | Max wait for a pooled connection | Wait forever |
//! | `MASTER_ENCRYPTION_KEY` | Base64 32-byte field encryption key | Required |
//! | `AUDIT_SALT` | Key for hashing user ids in the audit log | Random per process |
//! | `AUDIT_LOG_PATH` | Directory for daily audit JSONL files | Log only |
//! | `KOFI_WEBHOOK_TOKEN` | Ko-fi webhook signing secret | Webhook rejects all |
//! | `BINANCE_WEBHOOK_SECRET` | Binance webhook signing secret | Webhook rejects all |
//! | `BINANCE_API_KEY` | Exchange API key for deposit lookups | Ledger unavailable |
//! | `BINANCE_API_SECRET` | Exchange API secret | Ledger unavailable |
//! | `BINANCE_API_BASE_URL` | Exchange REST base URL | `https://api.binance.com` |
//! | `INTERNAL_API_TOKEN` | Token required by `/v1/payments/*` | Endpoints disabled |
//! | `TELEGRAM_TOKEN` | Bot token used for operator alerts | Alerts go to the log |
//! | `ADMIN_ID` | Operator chat id | Alerts go to the log |
//! | `SERVICE_UNIT` | systemd unit of this service | `tg-bot.service` |
//! | `DATABASE_UNIT` | systemd unit of the database | `postgresql` |
//! | `TEMP_DIR` | Scratch directory cleared on low disk | OS temp dir |
//! | `DISK_USAGE_THRESHOLD` | Disk usage ratio that fails the probe | `0.95` |
//! | `NETWORK_PROBE_ADDR` | `host:port` dialled by the network probe | `8.8.8.8:53` |
//! | `TLS_CERT_PATH` | PEM certificate chain (with `TLS_KEY_PATH`) | Plain HTTP |
//! | `TLS_KEY_PATH` | PEM private key | Plain HTTP |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=info` |

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::logging::LogFormat;
use crate::payments::DEFAULT_API_BASE_URL;
use crate::security::cipher::decode_master_key;
use crate::security::sealed::{
    ADMIN_ID, BINANCE_API_KEY, BINANCE_API_SECRET, BINANCE_WEBHOOK_SECRET, INTERNAL_API_TOKEN,
    KOFI_WEBHOOK_TOKEN, TELEGRAM_TOKEN,
};
use crate::supervisor::probes::{DEFAULT_DISK_USAGE_THRESHOLD, DEFAULT_NETWORK_PROBE_ADDR};

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const DB_POOL_SIZE_ENV: &str = "DB_POOL_SIZE";
pub const DB_ACQUIRE_TIMEOUT_ENV: &str = "DB_ACQUIRE_TIMEOUT_SECS";
pub const MASTER_ENCRYPTION_KEY_ENV: &str = "MASTER_ENCRYPTION_KEY";
pub const AUDIT_SALT_ENV: &str = "AUDIT_SALT";
pub const AUDIT_LOG_PATH_ENV: &str = "AUDIT_LOG_PATH";
pub const BINANCE_API_BASE_URL_ENV: &str = "BINANCE_API_BASE_URL";
pub const SERVICE_UNIT_ENV: &str = "SERVICE_UNIT";
pub const DATABASE_UNIT_ENV: &str = "DATABASE_UNIT";
pub const TEMP_DIR_ENV: &str = "TEMP_DIR";
pub const DISK_USAGE_THRESHOLD_ENV: &str = "DISK_USAGE_THRESHOLD";
pub const NETWORK_PROBE_ADDR_ENV: &str = "NETWORK_PROBE_ADDR";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// `DATABASE_URL` value selecting the in-process store.
pub const MEMORY_DATABASE_URL: &str = "memory://";

/// Environment variables that are sealed at startup. The variable name is
/// also the sealed setting name.
pub const SENSITIVE_VARS: [&str; 7] = [
    TELEGRAM_TOKEN,
    ADMIN_ID,
    KOFI_WEBHOOK_TOKEN,
    BINANCE_WEBHOOK_SECRET,
    BINANCE_API_KEY,
    BINANCE_API_SECRET,
    INTERNAL_API_TOKEN,
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Zeroizing<String>,
    pub db_pool_size: usize,
    pub db_acquire_timeout: Option<Duration>,
    pub master_key: Zeroizing<Vec<u8>>,
    pub audit_salt: Option<Zeroizing<String>>,
    pub audit_log_path: Option<PathBuf>,
    /// Set entries of [`SENSITIVE_VARS`].
    pub sensitive: Vec<(&'static str, Zeroizing<String>)>,
    pub binance_api_base_url: String,
    pub service_unit: String,
    pub database_unit: String,
    pub temp_dir: PathBuf,
    pub disk_usage_threshold: f64,
    pub network_probe_addr: String,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = match get(PORT_ENV) {
            Some(v) => v.trim().parse().map_err(|_| invalid(PORT_ENV, "not a port number"))?,
            None => 8080,
        };

        let database_url = Zeroizing::new(
            get(DATABASE_URL_ENV).ok_or(ConfigError::Missing(DATABASE_URL_ENV))?,
        );

        let db_pool_size = match get(DB_POOL_SIZE_ENV) {
            Some(v) => match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid(DB_POOL_SIZE_ENV, "must be a positive integer")),
            },
            None => 5,
        };

        let db_acquire_timeout = get(DB_ACQUIRE_TIMEOUT_ENV)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| invalid(DB_ACQUIRE_TIMEOUT_ENV, "must be whole seconds"))
            })
            .transpose()?;

        let encoded_key = Zeroizing::new(
            get(MASTER_ENCRYPTION_KEY_ENV).ok_or(ConfigError::Missing(MASTER_ENCRYPTION_KEY_ENV))?,
        );
        let master_key = decode_master_key(&encoded_key)
            .map_err(|e| invalid(MASTER_ENCRYPTION_KEY_ENV, e.to_string()))?;

        let sensitive = SENSITIVE_VARS
            .iter()
            .filter_map(|name| get(name).map(|v| (*name, Zeroizing::new(v))))
            .collect();

        let disk_usage_threshold = match get(DISK_USAGE_THRESHOLD_ENV) {
            Some(v) => match v.trim().parse::<f64>() {
                Ok(t) if t > 0.0 && t <= 1.0 => t,
                _ => return Err(invalid(DISK_USAGE_THRESHOLD_ENV, "must be in (0, 1]")),
            },
            None => DEFAULT_DISK_USAGE_THRESHOLD,
        };

        let tls = match (get(TLS_CERT_PATH_ENV), get(TLS_KEY_PATH_ENV)) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing(TLS_KEY_PATH_ENV)),
            (None, Some(_)) => return Err(ConfigError::Missing(TLS_CERT_PATH_ENV)),
        };

        Ok(Self {
            host: get(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            database_url,
            db_pool_size,
            db_acquire_timeout,
            master_key,
            audit_salt: get(AUDIT_SALT_ENV).map(Zeroizing::new),
            audit_log_path: get(AUDIT_LOG_PATH_ENV).map(PathBuf::from),
            sensitive,
            binance_api_base_url: get(BINANCE_API_BASE_URL_ENV)
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            service_unit: get(SERVICE_UNIT_ENV).unwrap_or_else(|| "tg-bot.service".to_string()),
            database_unit: get(DATABASE_UNIT_ENV).unwrap_or_else(|| "postgresql".to_string()),
            temp_dir: get(TEMP_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            disk_usage_threshold,
            network_probe_addr: get(NETWORK_PROBE_ADDR_ENV)
                .unwrap_or_else(|| DEFAULT_NETWORK_PROBE_ADDR.to_string()),
            tls,
            log_format: get(LOG_FORMAT_ENV)
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.as_str() == MEMORY_DATABASE_URL
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.sensitive.iter().any(|(n, _)| *n == name)
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sensitive: Vec<&str> = self.sensitive.iter().map(|(name, _)| *name).collect();
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr())
            .field("db_pool_size", &self.db_pool_size)
            .field("db_acquire_timeout", &self.db_acquire_timeout)
            .field("audit_log_path", &self.audit_log_path)
            .field("sensitive", &sensitive)
            .field("service_unit", &self.service_unit)
            .field("database_unit", &self.database_unit)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
