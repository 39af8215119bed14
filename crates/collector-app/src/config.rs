use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use types::{DeviceConfig, ServiceConfig};

/// The fully loaded, validated configuration: service tunables plus the
/// fleet of devices to poll (spec.md §3/§6).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub devices: Vec<DeviceConfig>,
    /// Where `add-device`/`remove-device`/`update-device` persist their
    /// edits. `None` when no file backs this config (defaults-only run).
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    /// Loads from `ADAM_CONFIG` (or an explicit override), then layers
    /// `ADAM_*` scalar overrides on top, following the same
    /// defaults → file → env-overrides → validate pipeline used
    /// throughout this codebase's config loading.
    pub fn load(path_override: Option<&str>) -> Result<Self> {
        let config_path = path_override
            .map(PathBuf::from)
            .or_else(|| env::var("ADAM_CONFIG").ok().map(PathBuf::from));

        let mut service = ServiceConfig::default();
        let mut devices = Vec::new();

        if let Some(path) = &config_path {
            let file = load_file(path)?;
            service = file.service;
            devices = file.devices;
        }

        apply_env_overrides(&mut service);

        Ok(Self {
            service,
            devices,
            config_path,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.id.clone()) {
                anyhow::bail!("duplicate device id {}", device.id);
            }
        }
        Ok(())
    }

    /// Writes the current set of devices and service tunables back to
    /// `config_path`, for the `add-device`/`remove-device`/`update-device`
    /// CLI commands. There is no running-process control channel in
    /// scope (spec.md §1 excludes HTTP/RPC fronts), so these commands
    /// edit the declarative config the next `start` will load.
    pub fn persist(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .context("no config file to persist to; pass --config")?;
        let file = FileConfig {
            service: self.service.clone(),
            devices: self.devices.clone(),
        };
        let ext = path.extension().and_then(|value| value.to_str());
        let serialized = match ext {
            Some("json") => serde_json::to_string_pretty(&file).context("serialize json config")?,
            _ => toml::to_string_pretty(&file).context("serialize toml config")?,
        };
        fs::write(path, serialized).with_context(|| format!("write config file {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct FileConfig {
    #[serde(flatten)]
    service: ServiceConfig,
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read config file {}", path.display()))?;
    let ext = path.extension().and_then(|value| value.to_str());
    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };
    Ok(config)
}

fn apply_env_overrides(service: &mut ServiceConfig) {
    if let Some(value) = parse_env_u64("ADAM_POLL_INTERVAL_MS") {
        service.poll_interval_ms = value;
    }
    if let Some(value) = parse_env_u64("ADAM_HEALTH_CHECK_INTERVAL_MS") {
        service.health_check_interval_ms = value;
    }
    if let Some(value) = parse_env_usize("ADAM_MAX_CONCURRENT_DEVICES") {
        service.max_concurrent_devices = value;
    }
    if let Some(value) = parse_env_usize("ADAM_DATA_BUFFER_SIZE") {
        service.data_buffer_size = value;
    }
    if let Some(value) = parse_env_usize("ADAM_BATCH_SIZE") {
        service.batch_size = value;
    }
    if let Some(value) = parse_env_u64("ADAM_BATCH_TIMEOUT_MS") {
        service.batch_timeout_ms = value;
    }
    if let Some(value) = parse_env_u32("ADAM_MAX_CONSECUTIVE_FAILURES") {
        service.max_consecutive_failures = value;
    }
    if let Some(value) = parse_env_u64("ADAM_DEVICE_TIMEOUT_MS") {
        service.device_timeout_ms = value;
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_no_file_validate() {
        let config = AppConfig {
            service: ServiceConfig::default(),
            devices: Vec::new(),
            config_path: None,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_applies_on_top_of_defaults() {
        std::env::set_var("ADAM_POLL_INTERVAL_MS", "2500");
        let mut service = ServiceConfig::default();
        apply_env_overrides(&mut service);
        std::env::remove_var("ADAM_POLL_INTERVAL_MS");
        assert_eq!(service.poll_interval_ms, 2500);
    }
}
