// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use subscription_guard::api::router;
use subscription_guard::config::{AppConfig, LOG_FORMAT_ENV};
use subscription_guard::logging::{init_tracing, LogFormat};
use subscription_guard::metrics::Metrics;
use subscription_guard::payments::{BinanceLedger, PaymentMonitor, PaymentPoller};
use subscription_guard::resilience::{Backoff, CircuitBreaker};
use subscription_guard::security::cipher::generate_master_key;
use subscription_guard::security::sealed::{ADMIN_ID, TELEGRAM_TOKEN};
use subscription_guard::security::{
    AuditEvent, AuditEventType, AuditLog, CipherService, SealedSettings, SecretVault,
    MASTER_ENCRYPTION,
};
use subscription_guard::state::AppState;
use subscription_guard::storage::{
    Connector, MemoryDatabase, PgConnector, PoolConfig, ResilientStore, StoreResult,
};
use subscription_guard::supervisor::notifier::DEFAULT_TELEGRAM_API_URL;
use subscription_guard::supervisor::{
    ClearTempDir, DiskProbe, HealthCheck, LogNotifier, NetworkProbe, Notifier, ProbeSet,
    RebuildPool, RecoveryPlan, RestartUnit, ServiceProbe, StoreProbe, Supervisor,
    TelegramNotifier, VacuumJournal,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DB_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    // `subscription-guard keygen` prints a fresh MASTER_ENCRYPTION_KEY.
    if std::env::args().nth(1).as_deref() == Some("keygen") {
        println!("{}", generate_master_key().as_str());
        return ExitCode::SUCCESS;
    }

    // Install the ring crypto provider for rustls (must be done before any TLS operations)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    init_tracing(LogFormat::parse(
        &std::env::var(LOG_FORMAT_ENV).unwrap_or_default(),
    ));

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Subscription guard failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let mut config = AppConfig::from_env()?;
    info!(config = ?config, "Configuration loaded");

    // Secrets
    let vault = Arc::new(SecretVault::new());
    vault.store(MASTER_ENCRYPTION, config.master_key.to_vec());
    let cipher = Arc::new(CipherService::new(Arc::clone(&vault)));
    let settings = Arc::new(SealedSettings::new(CipherService::new(Arc::clone(&vault))));
    for (name, value) in config.sensitive.drain(..) {
        settings.seal(name, &value)?;
    }

    let audit = {
        let salt = match config.audit_salt.take() {
            Some(salt) => salt.as_bytes().to_vec(),
            None => {
                warn!("AUDIT_SALT not set; actor hashes will not match across restarts");
                let mut salt = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        };
        let mut audit = AuditLog::new(salt);
        if let Some(dir) = &config.audit_log_path {
            audit = audit.with_dir(dir);
        }
        Arc::new(audit)
    };
    audit.log(AuditEvent::new(AuditEventType::AppStart));
    let metrics = Arc::new(Metrics::new()?);

    // Storage
    let connector: Arc<dyn Connector> = if config.uses_memory_store() {
        warn!("Using in-memory store; payments will not survive a restart");
        Arc::new(MemoryDatabase::new().connector())
    } else {
        Arc::new(PgConnector::new(&config.database_url, DB_CONNECT_TIMEOUT)?)
    };
    let store = Arc::new(ResilientStore::new(
        connector,
        PoolConfig::default()
            .with_capacity(config.db_pool_size)
            .with_acquire_timeout(config.db_acquire_timeout),
    ));
    initialize_store(&store).await?;

    // Payments
    let ledger = Arc::new(BinanceLedger::new(
        &config.binance_api_base_url,
        Arc::clone(&settings),
    )?);
    let monitor = Arc::new(
        PaymentMonitor::new(
            Arc::clone(&store),
            ledger,
            Arc::clone(&cipher),
            Arc::clone(&audit),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    // Supervisor
    let notifier: Arc<dyn Notifier> =
        if settings.is_set(TELEGRAM_TOKEN) && settings.is_set(ADMIN_ID) {
            Arc::new(TelegramNotifier::new(
                DEFAULT_TELEGRAM_API_URL,
                Arc::clone(&settings),
            )?)
        } else {
            warn!("Telegram alerts not configured; alerts go to the log");
            Arc::new(LogNotifier)
        };
    let probes = ProbeSet::new()
        .with_probe(Arc::new(StoreProbe::new(Arc::clone(&store))))
        .with_probe(Arc::new(NetworkProbe::new(config.network_probe_addr.clone())))
        .with_probe(Arc::new(DiskProbe::new("/", config.disk_usage_threshold)))
        .with_probe(Arc::new(ServiceProbe::new(config.service_unit.clone())));
    let plan = RecoveryPlan::default()
        .with_action(HealthCheck::Store, Arc::new(RebuildPool::new(Arc::clone(&store))))
        .with_action(
            HealthCheck::Store,
            Arc::new(RestartUnit::new(config.database_unit.clone())),
        )
        .with_action(
            HealthCheck::Service,
            Arc::new(RestartUnit::new(config.service_unit.clone())),
        )
        .with_action(HealthCheck::Disk, Arc::new(ClearTempDir::new(config.temp_dir.clone())))
        .with_action(HealthCheck::Disk, Arc::new(VacuumJournal::default()));
    let supervisor = Arc::new(
        Supervisor::new(probes, plan, notifier, Arc::clone(&audit))
            .with_restart(
                Arc::new(RestartUnit::new(config.service_unit.clone())),
                Arc::new(ServiceProbe::new(config.service_unit.clone())),
            )
            .with_metrics(Arc::clone(&metrics)),
    );

    // Background loops
    let shutdown = CancellationToken::new();
    let poller = PaymentPoller::new(Arc::clone(&monitor)).with_error_sink(supervisor.clone());
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));
    let supervisor_task = tokio::spawn(Arc::clone(&supervisor).run(shutdown.clone()));

    // HTTP
    let state = AppState {
        monitor,
        settings,
        audit: Arc::clone(&audit),
        breaker: Arc::new(CircuitBreaker::default()),
        supervisor,
        store: Arc::clone(&store),
        metrics,
    };
    let app = router(state);
    let addr: SocketAddr = config.bind_addr().parse()?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
            handle.graceful_shutdown(Some(SHUTDOWN_TIMEOUT));
        }
    });

    let served = match &config.tls {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!(%addr, "Subscription guard listening on https (docs at /docs)");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(%addr, "Subscription guard listening on http (docs at /docs)");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    // Shutdown: stop loops, close the pool, then wipe secrets.
    shutdown.cancel();
    let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        if let Err(e) = poller_task.await {
            error!(error = %e, "Payment poller task failed");
        }
        if let Err(e) = supervisor_task.await {
            error!(error = %e, "Health supervisor task failed");
        }
    })
    .await;
    if joined.is_err() {
        warn!("Background loops did not stop in time");
    }
    store.close();
    audit.log(AuditEvent::new(AuditEventType::AppShutdown));
    let erased = vault.erase_all();
    info!(erased, "Secrets erased, shutdown complete");

    served?;
    Ok(())
}

/// Create the schema, waiting out a database that is still starting.
async fn initialize_store(store: &ResilientStore) -> StoreResult<()> {
    let backoff = Backoff::default().with_max_attempts(5);
    let mut attempt = 0;
    loop {
        match store.initialize().await {
            Ok(()) => return Ok(()),
            Err(e) if backoff.should_retry(attempt) => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, error = %e, "Database not ready, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}
