use qsync::compare::ChecksumComparator;
use qsync::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use qsync::context::{SyncContext, SyncSettings};
use qsync::driver::{Driver, SyncSessions, resolve_provider_location};
use qsync::postgres::{ConnectOptions, PgSession, provider_connect_options};
use qsync::sync::RunReport;
use qsync_config::shared::{
    ComparatorKind, IntoConnectOptions, PgConnectionConfig, SyncerConfig, TlsConfig,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs one consistency check with the provided configuration.
///
/// Opens the sessions of the run, resolving the provider through the subscriber's node
/// metadata unless it is configured explicitly, then checks `tables` and returns the
/// report. SIGINT and SIGTERM stop the run before the next table, after releasing what
/// the current table holds.
pub async fn start_checker_with_config(
    config: SyncerConfig,
    tables: Vec<String>,
    force: bool,
) -> anyhow::Result<RunReport> {
    info!("starting consistency checker");

    log_config(&config, force);

    let subscriber = PgSession::connect(&config.connection).await?;

    let (provider_options, provider_tls) = match &config.provider {
        Some(provider) => {
            log_pg_connection_config(provider, "provider");
            (provider.with_db(), provider.tls.clone())
        }
        None => {
            let location = resolve_provider_location(&subscriber, &config.queue_name).await?;
            debug!("provider location resolved from subscriber node metadata");
            (
                provider_connect_options(&location, &config.connection)?,
                config.connection.tls.clone(),
            )
        }
    };

    let lock = connect_provider(&provider_options, &provider_tls).await?;
    let provider = connect_provider(&provider_options, &provider_tls).await?;
    let admin = connect_provider(&provider_options, &provider_tls).await?;

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let shutdown_handle = spawn_shutdown_listener(shutdown_tx.clone());

    let settings = SyncSettings::from_config(&config, force);
    let mut ctx = SyncContext::new(settings, shutdown_rx);
    let sessions = SyncSessions {
        lock: &lock,
        provider: &provider,
        subscriber: &subscriber,
        admin: &admin,
    };

    let result = match config.comparator {
        ComparatorKind::Checksum => {
            Driver::new(sessions, &ChecksumComparator)
                .run(&mut ctx, &tables)
                .await
        }
    };

    // The listener is only needed while the run is in progress.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;
    drop(shutdown_tx);

    Ok(result?)
}

async fn connect_provider(options: &ConnectOptions, tls: &TlsConfig) -> anyhow::Result<PgSession> {
    Ok(PgSession::connect_with(options.clone(), tls).await?)
}

/// Listens for SIGINT and SIGTERM and requests a shutdown of the run.
fn spawn_shutdown_listener(shutdown_tx: ShutdownTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!("failed to register SIGTERM handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, stopping consistency check");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping consistency check");
            }
        }

        if let Err(e) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {:?}", e);
        }
    })
}

fn log_config(config: &SyncerConfig, force: bool) {
    debug!(
        job_name = config.job_name,
        queue_name = config.queue_name,
        consumer_name = config.consumer_name(),
        lock_timeout_secs = config.lock_timeout_secs,
        tick_timeout_secs = config.tick_timeout_secs,
        poll_interval_ms = config.poll_interval_ms,
        lag_margin_secs = config.lag_margin_secs,
        comparator = ?config.comparator,
        force,
        "checker config"
    );
    log_pg_connection_config(&config.connection, "subscriber");
}

fn log_pg_connection_config(config: &PgConnectionConfig, role: &str) {
    debug!(
        role,
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "postgres connection config",
    );
}
