//! # Live Broker Poll Test
//!
//! Runs poll-mode ticks against a real MQTT broker through lib_telemetry and
//! prints what each tick collected plus the resulting device state.

use clap::Parser;
use lib_telemetry::{
    setup_logging, ConsumerView, DeviceStateStore, HistoryCursor, IngestConfig, IngestionLoop,
    LogOptions, MqttConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(about = "Poll a live MQTT broker and print the aggregated device state")]
struct Args {
    #[clap(long, default_value = "localhost", help = "Broker host.")]
    host: String,

    #[clap(long, default_value_t = 1883, help = "Broker port.")]
    port: u16,

    #[clap(long, help = "Optional JSON ingestion config; host/port flags override it.")]
    config: Option<PathBuf>,

    #[clap(long, default_value_t = 3, help = "Number of poll ticks to run.")]
    ticks: u32,

    #[clap(long, default_value_t = 400, help = "Collection window per tick in milliseconds.")]
    window_ms: u64,

    #[clap(long, default_value_t = 1000, help = "Pause between ticks in milliseconds.")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = setup_logging(&LogOptions {
        default_level: "debug".to_string(),
        ..LogOptions::default()
    })?;

    let mut config = match &args.config {
        Some(path) => IngestConfig::from_json_file(path)?,
        None => IngestConfig::default(),
    };
    config.broker.host = args.host.clone();
    config.broker.port = args.port;
    config.validate()?;

    let store = Arc::new(DeviceStateStore::new(config.primary_field, config.retention_policy()?));
    let view = ConsumerView::new(Arc::clone(&store));
    let ingestion = IngestionLoop::new(
        MqttConnector::new(),
        Arc::new(config.decoder()?),
        store,
        config.ingestion_settings(),
    );

    println!("[*] Polling {}:{} for {} tick(s)...", args.host, args.port, args.ticks);

    let window = Duration::from_millis(args.window_ms);
    for tick in 1..=args.ticks {
        let report = ingestion.poll_once(window).await;
        println!(
            "[tick {}] received={} applied={} ignored={} rejected={}",
            tick, report.received, report.applied, report.ignored, report.rejected
        );
        if let Some(e) = &report.error {
            eprintln!("[tick {}] connection problem: {}", tick, e);
        }
        if tick < args.ticks {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    println!("\n[STATE]");
    println!("-----------------------------------------------");
    println!("{}", serde_json::to_string_pretty(&view.current_state())?);
    println!("-----------------------------------------------");

    let history = view.history_since(HistoryCursor::Start);
    println!("[INFO] {} snapshot(s) captured", history.len());
    for snapshot in history {
        println!("{}", serde_json::to_string(snapshot.as_ref())?);
    }

    if view.current_state().is_empty() {
        println!("[INFO] Waiting for data: nothing received from the device.");
    }
    Ok(())
}
