use anyhow::{Context, Result};
use lib_telemetry::{
    setup_logging, ConsumerView, DeviceStateStore, IngestionLoop, LogOptions, MqttConnector,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod telemetry_logic;
use telemetry_logic::{config, http, monitor};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal; variables may come from the environment.
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    let _log_guard = setup_logging(&LogOptions {
        default_level: config.log_level.clone().unwrap_or_else(|| "info".to_string()),
        log_dir: config.log_dir.clone(),
        file_prefix: "server_telemetry".to_string(),
        ansi: true,
    })?;

    let ingest = config.ingest_config().context("invalid ingestion configuration")?;
    let decoder = Arc::new(ingest.decoder()?);
    let retention = ingest.retention_policy()?;
    let store = Arc::new(DeviceStateStore::new(ingest.primary_field, retention));
    let view = ConsumerView::new(Arc::clone(&store));

    info!(
        broker = %format!("{}:{}", ingest.broker.host, ingest.broker.port),
        mode = ?ingest.mode.kind,
        primary_field = %ingest.primary_field,
        channels = decoder.channels().len(),
        "telemetry server starting"
    );

    let settings = ingest.ingestion_settings();
    let ingestion = IngestionLoop::new(MqttConnector::new(), decoder, store, settings);
    let link = ingestion.link_state();
    let stale_after = Duration::from_secs(config.stale_after_secs.unwrap_or(30));

    let bind: IpAddr = config
        .bind_address
        .as_deref()
        .unwrap_or("0.0.0.0")
        .parse()
        .context("invalid bind address")?;
    let addr = SocketAddr::new(bind, config.port.unwrap_or(8080));

    let shutdown = CancellationToken::new();

    let ingestion_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { ingestion.run(shutdown).await }
    });

    let monitor_handle = tokio::spawn(monitor::run(
        view.clone(),
        link.clone(),
        stale_after,
        shutdown.clone(),
    ));

    let http_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let app_state = http::AppState::new(view, link, stale_after);
        async move {
            let served = http::serve(addr, app_state, shutdown.clone()).await;
            // Without the API there is nothing to serve; stop everything else too.
            shutdown.cancel();
            served
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate_signal() => {
            info!("SIGTERM received, initiating shutdown.");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();

    let (ingestion_res, monitor_res, http_res) =
        tokio::join!(ingestion_handle, monitor_handle, http_handle);
    if let Err(e) = ingestion_res {
        error!("Ingestion task failed: {}", e);
    }
    if let Err(e) = monitor_res {
        warn!("Monitor task failed: {}", e);
    }
    match http_res {
        Ok(Err(e)) => error!("HTTP API stopped with error: {:#}", e),
        Err(e) => error!("HTTP API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
