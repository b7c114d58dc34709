use anyhow::{Context, Result};
use clap::Parser;
use lib_telemetry::{ConfigurationError, FieldName, IngestConfig, ModeKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "server_telemetry.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Device telemetry ingestion server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TELEMETRY_PORT", help = "HTTP port for the state and history API.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_BIND", help = "Address the HTTP API binds to.")]
    pub bind_address: Option<String>,

    #[clap(long, env = "TELEMETRY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for JSON log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(
        long,
        env = "TELEMETRY_LOG_LEVEL",
        help = "Logging level (trace, debug, info, warn, error)."
    )]
    pub log_level: Option<String>,

    #[clap(long, env = "TELEMETRY_BROKER_HOST", help = "MQTT broker host.")]
    pub broker_host: Option<String>,

    #[clap(long, env = "TELEMETRY_BROKER_PORT", help = "MQTT broker port.")]
    pub broker_port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CLIENT_ID", help = "MQTT client identifier.")]
    pub client_id: Option<String>,

    #[clap(
        long,
        env = "TELEMETRY_MODE",
        value_parser = parse_mode,
        help = "Ingestion mode: persistent or poll."
    )]
    pub mode: Option<ModeKind>,

    #[clap(
        long,
        env = "TELEMETRY_POLL_WINDOW_MS",
        help = "Poll mode: collection window per tick in milliseconds."
    )]
    pub poll_window_ms: Option<u64>,

    #[clap(
        long,
        env = "TELEMETRY_POLL_INTERVAL_MS",
        help = "Poll mode: time between ticks in milliseconds."
    )]
    pub poll_interval_ms: Option<u64>,

    #[clap(
        long,
        env = "TELEMETRY_PRIMARY_FIELD",
        value_parser = parse_field,
        help = "Field whose updates append history snapshots."
    )]
    pub primary_field: Option<FieldName>,

    #[clap(
        long,
        env = "TELEMETRY_RECONNECT_BASE_DELAY_MS",
        help = "Base delay in milliseconds for reconnect attempts."
    )]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(
        long,
        env = "TELEMETRY_RECONNECT_MAX_DELAY_MS",
        help = "Maximum delay in milliseconds for reconnect attempts."
    )]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(
        long,
        env = "TELEMETRY_MAX_SNAPSHOTS",
        help = "Keep at most this many history snapshots."
    )]
    pub max_snapshots: Option<usize>,

    #[clap(
        long,
        env = "TELEMETRY_MAX_AGE_SECS",
        help = "Drop history snapshots older than this many seconds."
    )]
    pub max_age_secs: Option<u64>,

    #[clap(
        long,
        env = "TELEMETRY_STALE_AFTER_SECS",
        help = "Seconds without a new snapshot before data is reported stale."
    )]
    pub stale_after_secs: Option<u64>,

    /// Engine settings that only the config file can express (channel table and friends).
    #[clap(skip)]
    pub ingest: Option<IngestConfig>,
}

fn parse_mode(raw: &str) -> Result<ModeKind, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "persistent" => Ok(ModeKind::Persistent),
        "poll" => Ok(ModeKind::Poll),
        other => Err(format!("unknown mode '{other}', expected persistent or poll")),
    }
}

fn parse_field(raw: &str) -> Result<FieldName, String> {
    raw.trim().parse::<FieldName>().map_err(|e| e.to_string())
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            bind_address: other.bind_address.or(self.bind_address),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker_host: other.broker_host.or(self.broker_host),
            broker_port: other.broker_port.or(self.broker_port),
            client_id: other.client_id.or(self.client_id),
            mode: other.mode.or(self.mode),
            poll_window_ms: other.poll_window_ms.or(self.poll_window_ms),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            primary_field: other.primary_field.or(self.primary_field),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_snapshots: other.max_snapshots.or(self.max_snapshots),
            max_age_secs: other.max_age_secs.or(self.max_age_secs),
            stale_after_secs: other.stale_after_secs.or(self.stale_after_secs),
            ingest: other.ingest.or(self.ingest),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8080),
            bind_address: Some("0.0.0.0".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            stale_after_secs: Some(30),
            ..Default::default()
        }
    }

    /// Engine configuration: the file's `ingest` section (or stock defaults)
    /// with every flat override applied, then validated.
    pub fn ingest_config(&self) -> Result<IngestConfig, ConfigurationError> {
        let mut ingest = self.ingest.clone().unwrap_or_default();

        if let Some(host) = &self.broker_host {
            ingest.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            ingest.broker.port = port;
        }
        if let Some(client_id) = &self.client_id {
            ingest.broker.client_id = client_id.clone();
        }
        if let Some(kind) = self.mode {
            ingest.mode.kind = kind;
        }
        if let Some(window) = self.poll_window_ms {
            ingest.mode.poll_window_ms = window;
        }
        if let Some(interval) = self.poll_interval_ms {
            ingest.mode.poll_interval_ms = interval;
        }
        if let Some(field) = self.primary_field {
            ingest.primary_field = field;
        }
        if let Some(base) = self.reconnect_base_delay_ms {
            ingest.reconnect.base_delay_ms = base;
        }
        if let Some(max) = self.reconnect_max_delay_ms {
            ingest.reconnect.max_delay_ms = max;
        }
        if let Some(max) = self.max_snapshots {
            ingest.retention.max_snapshots = Some(max);
        }
        if let Some(age) = self.max_age_secs {
            ingest.retention.max_age_secs = Some(age);
        }

        ingest.validate()?;
        Ok(ingest)
    }
}

/// Layers defaults, the JSON file, then env/CLI (already folded into `cli` by clap).
pub fn resolve_config(cli: Config) -> Result<Config> {
    let mut current_config = Config::defaults();

    let explicit_path = cli.config_path.clone();
    let config_file_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        let file_config = read_config_file(&config_file_path)?;
        current_config = current_config.merge(file_config);
    } else if explicit_path.is_some() {
        anyhow::bail!("config file not found: {}", config_file_path.display());
    } else {
        info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    Ok(current_config.merge(cli))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

pub fn load_config() -> Result<Config> {
    resolve_config(Config::parse())
}
