use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use collector_app::cli::{Cli, Command};
use collector_app::config::AppConfig;
use health::{HealthTracker, Outcome};
use modbus_client::{ClientConfig, ClientError, DeviceSession};
use orchestrator::Orchestrator;
use sink::LoggingSink;
use types::DeviceConfig;

const EXIT_SUCCESS: i32 = 0;
const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_STARTUP_FAILURE: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            EXIT_STARTUP_FAILURE
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Start => run_start(cli.config.as_deref()).await,
        Command::Stop => run_stop(cli.config.as_deref()),
        Command::AddDevice { path } => run_add_device(cli.config.as_deref(), &path),
        Command::RemoveDevice { id } => run_remove_device(cli.config.as_deref(), &id),
        Command::UpdateDevice { path } => run_update_device(cli.config.as_deref(), &path),
        Command::Health { id } => run_health(cli.config.as_deref(), id.as_deref()).await,
    }
}

fn load_and_validate(config_path: Option<&str>) -> Result<Option<AppConfig>> {
    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return Ok(None);
        }
    };
    if let Err(err) = config.validate() {
        error!(error = %err, "config failed validation");
        return Ok(None);
    }
    Ok(Some(config))
}

async fn run_start(config_path: Option<&str>) -> Result<i32> {
    let Some(config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };

    if let Err(err) = install_metrics_exporter() {
        error!(error = %err, "failed to install metrics exporter");
        return Ok(EXIT_STARTUP_FAILURE);
    }

    let orchestrator = Orchestrator::new(config.service.clone(), Arc::new(LoggingSink));
    for device in config.devices {
        if let Err(err) = orchestrator.add_device(device.clone()).await {
            error!(device_id = %device.id, error = %err, "failed to register device");
            return Ok(EXIT_STARTUP_FAILURE);
        }
    }

    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;
    info!("acquisition service started");

    let interrupted = tokio::signal::ctrl_c().await.is_ok();
    if interrupted {
        info!("interrupt received, shutting down");
    }
    orchestrator.stop().await;
    info!("acquisition service stopped");

    Ok(if interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_SUCCESS
    })
}

fn install_metrics_exporter() -> Result<()> {
    let addr: SocketAddr = "0.0.0.0:9898".parse().expect("valid socket address");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")
}

/// There is no running daemon to signal (spec.md §1 excludes HTTP/RPC
/// fronts), so this validates the config and tells the operator how to
/// actually stop a running `start` process.
fn run_stop(config_path: Option<&str>) -> Result<i32> {
    let Some(_config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };
    info!("config is valid; send SIGINT/SIGTERM to the running `start` process to stop it");
    Ok(EXIT_SUCCESS)
}

fn run_add_device(config_path: Option<&str>, fragment_path: &str) -> Result<i32> {
    let Some(mut config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };

    let device = match parse_device_fragment(fragment_path) {
        Ok(device) => device,
        Err(err) => {
            error!(error = %err, "failed to parse device fragment");
            return Ok(EXIT_INVALID_CONFIG);
        }
    };
    if let Err(err) = device.validate() {
        error!(error = %err, "device config failed validation");
        return Ok(EXIT_INVALID_CONFIG);
    }
    if config.devices.iter().any(|existing| existing.id == device.id) {
        error!(device_id = %device.id, "device already present in config");
        return Ok(EXIT_INVALID_CONFIG);
    }

    config.devices.push(device);
    config.persist().context("persist config")?;
    info!("device added");
    Ok(EXIT_SUCCESS)
}

fn run_remove_device(config_path: Option<&str>, id: &str) -> Result<i32> {
    let Some(mut config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };

    let before = config.devices.len();
    config.devices.retain(|device| device.id != id);
    if config.devices.len() == before {
        error!(device_id = %id, "device not found in config");
        return Ok(EXIT_INVALID_CONFIG);
    }

    config.persist().context("persist config")?;
    info!("device removed");
    Ok(EXIT_SUCCESS)
}

fn run_update_device(config_path: Option<&str>, fragment_path: &str) -> Result<i32> {
    let Some(mut config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };

    let device = match parse_device_fragment(fragment_path) {
        Ok(device) => device,
        Err(err) => {
            error!(error = %err, "failed to parse device fragment");
            return Ok(EXIT_INVALID_CONFIG);
        }
    };
    if let Err(err) = device.validate() {
        error!(error = %err, "device config failed validation");
        return Ok(EXIT_INVALID_CONFIG);
    }

    let Some(slot) = config.devices.iter_mut().find(|existing| existing.id == device.id) else {
        error!(device_id = %device.id, "device not found in config");
        return Ok(EXIT_INVALID_CONFIG);
    };
    *slot = device;

    config.persist().context("persist config")?;
    info!("device updated");
    Ok(EXIT_SUCCESS)
}

async fn run_health(config_path: Option<&str>, id: Option<&str>) -> Result<i32> {
    let Some(config) = load_and_validate(config_path)? else {
        return Ok(EXIT_INVALID_CONFIG);
    };

    let targets: Vec<&DeviceConfig> = match id {
        Some(id) => match config.devices.iter().find(|device| device.id == id) {
            Some(device) => vec![device],
            None => {
                error!(device_id = %id, "device not found in config");
                return Ok(EXIT_INVALID_CONFIG);
            }
        },
        None => config.devices.iter().collect(),
    };

    if targets.is_empty() {
        warn!("no devices configured");
    }

    let cancel = CancellationToken::new();
    for device in targets {
        let session = DeviceSession::new(to_client_config(device), device.unit_id);
        let mut tracker = HealthTracker::new(device.id.clone(), 1);

        let outcome = match session.test_connectivity(&cancel).await {
            Ok(latency) => Outcome::Success { latency },
            Err(err) => Outcome::Failure {
                disconnected: matches!(err, ClientError::ConnectionFailed(_) | ClientError::Closed),
                error_message: err.to_string(),
            },
        };
        let health = tracker.record(&outcome);
        session.close().await;

        println!(
            "{}: status={:?} connected={} latency_ms={:?} error={:?}",
            device.id, health.status, health.is_connected, health.avg_latency_ms, health.last_error
        );
    }

    Ok(EXIT_SUCCESS)
}

fn to_client_config(device: &DeviceConfig) -> ClientConfig {
    ClientConfig {
        host: device.host.clone(),
        port: device.port,
        timeout_ms: device.timeout_ms,
        retry_count: device.max_retries as usize,
        retry_backoff_ms: device.retry_delay_ms,
        keepalive: device.keepalive,
        nagle: device.nagle,
        socket_recv_buffer: device.socket_recv_buffer,
        socket_send_buffer: device.socket_send_buffer,
        ..ClientConfig::default()
    }
}

fn parse_device_fragment(path: &str) -> Result<DeviceConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("read {path}"))?;
    let ext = Path::new(path).extension().and_then(|value| value.to_str());
    let device = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json device fragment")?,
        _ => toml::from_str(&content).context("parse toml device fragment")?,
    };
    Ok(device)
}
