#![allow(dead_code)]

//! Shared data model for the acquisition core: readings, health records,
//! and the configuration records that describe devices, channels, and the
//! service as a whole. Everything here is a plain value type; behavior
//! lives in the crates that own it (`modbus-client`, `processor`, `health`,
//! `registry`, ...).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tag value attached to a reading or forwarded to the sink. Kept as an
/// enum (rather than stringified eagerly) so numeric tags survive until a
/// sink that cares about the distinction sees them (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    String(String),
    Number(f64),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Number(value)
    }
}

pub type TagMap = HashMap<String, TagValue>;

/// Trustworthiness of a reading, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    Timeout,
    DeviceFailure,
    ConfigurationError,
    Overflow,
}

impl Quality {
    pub fn is_good(self) -> bool {
        matches!(self, Quality::Good)
    }
}

/// An immutable record produced per successful or failed channel read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub channel: u8,
    pub timestamp: DateTime<Utc>,
    pub acquisition_duration: Duration,
    pub raw_value: i64,
    pub processed_value: Option<f64>,
    pub rate: Option<f64>,
    pub quality: Quality,
    pub unit: String,
    pub tags: TagMap,
    pub error_message: Option<String>,
}

impl Reading {
    /// Checks the invariants of spec.md §3 hold for this record.
    pub fn check_invariants(&self) -> bool {
        !(self.error_message.is_some() && self.quality == Quality::Good)
    }
}

/// Per-device status, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Online,
    Warning,
    Error,
    Offline,
    Unknown,
}

/// Per-device health, mutated over time and republished on every outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub is_connected: bool,
    pub last_successful_read_age: Option<Duration>,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub total_reads: u64,
    pub successful_reads: u64,
}

impl Health {
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_reads == 0 {
            return None;
        }
        Some((self.successful_reads as f64 / self.total_reads as f64) * 100.0)
    }

    /// Checks the invariants of spec.md §3/§8 hold for this record.
    pub fn check_invariants(&self) -> bool {
        self.successful_reads <= self.total_reads
            && (self.consecutive_failures == 0) == self.is_connected
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("device id must not be empty")]
    EmptyDeviceId,
    #[error("invalid port: must be 1..=65535")]
    InvalidPort,
    #[error("invalid unit id: must be 1..=255")]
    InvalidUnitId,
    #[error("invalid max_retries: must be 0..=10")]
    InvalidMaxRetries,
    #[error("channel {0}: scale must not be zero")]
    ZeroScale(u8),
    #[error("channel {0}: min ({1}) must be <= max ({2})")]
    MinGreaterThanMax(u8, f64, f64),
    #[error("channel {0}: register_count must be 1..=4")]
    InvalidRegisterCount(u8),
    #[error("channel {0}: start_register out of range")]
    InvalidStartRegister(u8),
    #[error("duplicate channel number {0}")]
    DuplicateChannel(u8),
    #[error("device has no channels")]
    NoChannels,
    #[error("poll_interval_ms must be within 100..=300000")]
    InvalidPollInterval,
    #[error("health_check_interval_ms must be within 5000..=300000")]
    InvalidHealthCheckInterval,
    #[error("max_concurrent_devices must be 1..=50")]
    InvalidConcurrency,
    #[error("batch_size must be 1..=1000")]
    InvalidBatchSize,
}

/// Per-channel acquisition configuration, validated before use (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_number: u8,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub start_register: u16,
    pub register_count: u8,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub decimal_places: u32,
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    #[serde(default)]
    pub max_rate_of_change: Option<f64>,
    #[serde(default)]
    pub tags: TagMap,
}

fn default_true() -> bool {
    true
}
fn default_scale() -> f64 {
    1.0
}
fn default_unit() -> String {
    "count".to_string()
}
fn default_max() -> f64 {
    u32::MAX as f64
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scale == 0.0 {
            return Err(ConfigError::ZeroScale(self.channel_number));
        }
        if self.min > self.max {
            return Err(ConfigError::MinGreaterThanMax(
                self.channel_number,
                self.min,
                self.max,
            ));
        }
        if !(1..=4).contains(&self.register_count) {
            return Err(ConfigError::InvalidRegisterCount(self.channel_number));
        }
        if self.start_register as u32 + self.register_count as u32 > u16::MAX as u32 + 1 {
            return Err(ConfigError::InvalidStartRegister(self.channel_number));
        }
        Ok(())
    }
}

/// Per-device acquisition configuration, validated before use (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default)]
    pub nagle: bool,
    #[serde(default = "default_socket_buffer")]
    pub socket_recv_buffer: u32,
    #[serde(default = "default_socket_buffer")]
    pub socket_send_buffer: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold: i64,
    #[serde(default)]
    pub tags: TagMap,
    pub channels: Vec<ChannelConfig>,
}

fn default_device_timeout_ms() -> u64 {
    3_000
}
fn default_max_retries() -> u8 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_socket_buffer() -> u32 {
    8 * 1024
}
fn default_rate_window_secs() -> u64 {
    300
}
fn default_overflow_threshold() -> i64 {
    4_294_967_295
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.unit_id == 0 {
            return Err(ConfigError::InvalidUnitId);
        }
        if self.max_retries > 10 {
            return Err(ConfigError::InvalidMaxRetries);
        }
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.channel_number) {
                return Err(ConfigError::DuplicateChannel(channel.channel_number));
            }
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Service-wide tunables (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_max_concurrent_devices")]
    pub max_concurrent_devices: usize,
    #[serde(default = "default_data_buffer_size")]
    pub data_buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_max_concurrent_devices() -> usize {
    5
}
fn default_data_buffer_size() -> usize {
    256
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    5_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_concurrent_devices: default_max_concurrent_devices(),
            data_buffer_size: default_data_buffer_size(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            device_timeout_ms: default_device_timeout_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=300_000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval);
        }
        if !(5_000..=300_000).contains(&self.health_check_interval_ms) {
            return Err(ConfigError::InvalidHealthCheckInterval);
        }
        if !(1..=50).contains(&self.max_concurrent_devices) {
            return Err(ConfigError::InvalidConcurrency);
        }
        if !(1..=1000).contains(&self.batch_size) {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel(number: u8) -> ChannelConfig {
        ChannelConfig {
            channel_number: number,
            name: format!("chan_{number}"),
            description: None,
            enabled: true,
            start_register: 0,
            register_count: 2,
            scale: 1.0,
            offset: 0.0,
            unit: "count".to_string(),
            decimal_places: 2,
            min: 0.0,
            max: 1000.0,
            max_rate_of_change: None,
            tags: TagMap::default(),
        }
    }

    fn sample_device() -> DeviceConfig {
        DeviceConfig {
            id: "D1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 3_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            keepalive: true,
            nagle: false,
            socket_recv_buffer: 8192,
            socket_send_buffer: 8192,
            rate_window_secs: 300,
            overflow_threshold: 4_294_967_295,
            tags: TagMap::default(),
            channels: vec![sample_channel(0)],
        }
    }

    #[test]
    fn rejects_empty_device_id() {
        let mut device = sample_device();
        device.id = "  ".to_string();
        assert!(matches!(device.validate(), Err(ConfigError::EmptyDeviceId)));
    }

    #[test]
    fn rejects_zero_scale() {
        let mut device = sample_device();
        device.channels[0].scale = 0.0;
        assert!(matches!(device.validate(), Err(ConfigError::ZeroScale(0))));
    }

    #[test]
    fn rejects_start_register_that_would_overflow_the_address_space() {
        let mut device = sample_device();
        device.channels[0].start_register = u16::MAX;
        device.channels[0].register_count = 2;
        assert!(matches!(
            device.validate(),
            Err(ConfigError::InvalidStartRegister(0))
        ));
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut device = sample_device();
        device.channels[0].min = 10.0;
        device.channels[0].max = 1.0;
        assert!(matches!(
            device.validate(),
            Err(ConfigError::MinGreaterThanMax(0, _, _))
        ));
    }

    #[test]
    fn rejects_duplicate_channel_numbers() {
        let mut device = sample_device();
        device.channels.push(sample_channel(0));
        assert!(matches!(
            device.validate(),
            Err(ConfigError::DuplicateChannel(0))
        ));
    }

    #[test]
    fn accepts_well_formed_device() {
        assert!(sample_device().validate().is_ok());
    }

    #[test]
    fn health_success_rate_is_none_before_first_read() {
        let health = Health {
            device_id: "D1".to_string(),
            timestamp: Utc::now(),
            status: HealthStatus::Unknown,
            is_connected: false,
            last_successful_read_age: None,
            consecutive_failures: 0,
            avg_latency_ms: None,
            last_error: None,
            total_reads: 0,
            successful_reads: 0,
        };
        assert_eq!(health.success_rate(), None);
    }

    #[test]
    fn service_config_validates_poll_interval_bounds() {
        let mut config = ServiceConfig::default();
        config.poll_interval_ms = 50;
        assert!(config.validate().is_err());
        config.poll_interval_ms = 1_000;
        assert!(config.validate().is_ok());
    }
}
