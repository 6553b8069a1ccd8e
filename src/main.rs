use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skybind_client::api::ApiClient;
use skybind_client::config::AppConfig;
use skybind_client::correlator::Correlator;
use skybind_client::database::DbDropGuard;
use skybind_client::decoder::{self, DecoderProcess};
use skybind_client::errors::ClientError;
use skybind_client::models::LogLevel;
use skybind_client::parser::Parser;
use skybind_client::pinger::Pinger;
use skybind_client::sender::Sender;
use skybind_client::status::StatusHandle;
use skybind_client::timesync::{ClockSync, SystemClockSync};

/// Workers get this long to finish their current operation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let status = StatusHandle::new();
    // A compiled binary carries its dependencies; the stage exists for the
    // status endpoint's benefit.
    status.set_stage(|s| s.dependencies = true);

    // Stage 1: configuration.
    let config = AppConfig::load().context("loading configuration")?;
    config.validate().context("validating configuration")?;
    status.set_stage(|s| s.config = true);
    info!(
        "Configuration loaded (decoder {}:{}, api {})",
        config.decoder.host, config.decoder.port, config.api.url
    );

    // Stage 2: store.
    let db_guard = DbDropGuard::open(&config.database.file).context("opening database")?;
    let db = db_guard.db();
    status.set_stage(|s| s.database = true);
    db.append_log(
        LogLevel::Info,
        "MAIN",
        "Client started",
        Some(&format!("version {}", config.app.version)),
    );

    // Stage 3: clock sync; degraded local time is tolerated with a warning.
    match SystemClockSync.sync().await {
        Ok(message) => {
            info!("{}", message);
            status.set_stage(|s| s.time_sync = true);
        }
        Err(e) => warn!("Clock synchronisation failed, using local time: {}", e),
    }

    // Stage 4: decoder child.
    let decoder_process = DecoderProcess::spawn(&config.decoder).map_err(|e| {
        db.append_log(LogLevel::Error, "MAIN", "Decoder failed to start", Some(&e.to_string()));
        e
    })?;
    status.set_stage(|s| s.decoder = true);
    db.append_log(
        LogLevel::Info,
        "MAIN",
        "Decoder started",
        Some(&format!("pid {:?}", decoder_process.id())),
    );

    // Stage 5: wait for the decoder's listener.
    if let Err(e) = decoder::wait_for_port(&config.decoder).await {
        db.append_log(LogLevel::Error, "MAIN", "Decoder port never opened", Some(&e.to_string()));
        decoder_process.shutdown().await;
        return Err(e.into());
    }
    status.set_stage(|s| s.tcp_connection = true);

    info!("Bringup complete, starting workers");

    // Workers.
    let api = ApiClient::new(&config.api).context("building API client")?;
    let cancel = CancellationToken::new();
    let mut workers: JoinSet<Result<(), ClientError>> = JoinSet::new();

    workers.spawn(Parser::new(&config, db.clone(), status.clone()).run(cancel.clone()));
    workers.spawn(Correlator::new(&config, db.clone()).run(cancel.clone()));
    workers.spawn(Sender::new(&config, db.clone(), api.clone()).run(cancel.clone()));
    workers.spawn(Pinger::new(&config, db.clone(), api, status.clone()).run(cancel.clone()));

    spawn_signal_handlers(cancel.clone());

    // Run until a shutdown signal or the first worker failure.
    let mut first_error: Option<ClientError> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!("Worker failed: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    cancel.cancel();
                    break;
                }
                Some(Err(e)) => {
                    error!("Worker panicked: {}", e);
                    cancel.cancel();
                    break;
                }
            },
        }
    }

    // Drain workers within the grace period, then abort stragglers.
    let drain = async {
        while let Some(joined) = workers.join_next().await {
            if let Ok(Err(e)) = joined {
                error!("Worker failed during shutdown: {}", e);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Workers did not stop within {:?}, aborting", SHUTDOWN_GRACE);
        workers.shutdown().await;
    }

    decoder_process.shutdown().await;

    db.append_log(LogLevel::Info, "MAIN", "Client stopped", None);
    if let Err(e) = db.flush() {
        warn!("Final flush failed: {}", e);
    }
    drop(db_guard);

    match first_error {
        Some(e) => Err(e.into()),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handlers(cancel: CancellationToken) {
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt signal");
                ctrl_c_cancel.cancel();
            }
            Err(e) => error!("Error setting up signal handler: {}", e),
        }
    });

    #[cfg(unix)]
    {
        let sigterm_cancel = cancel;
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM");
                    sigterm_cancel.cancel();
                }
                Err(e) => error!("Error setting up SIGTERM handler: {}", e),
            }
        });
    }
    #[cfg(not(unix))]
    drop(cancel);
}
