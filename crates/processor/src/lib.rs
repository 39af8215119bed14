#![allow(dead_code)]

//! `ReadingProcessor`: register decode, scale/offset transform, rate
//! calculation, validation/quality assignment, and tag enrichment
//! (spec.md §4.2).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use types::{ChannelConfig, DeviceConfig, Quality, Reading, TagMap, TagValue};

const DEVICE_TYPE: &str = "ADAM-6051";
const COUNTER_32_MODULUS: i64 = 1i64 << 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("decode requires at least 1 register, got 0")]
    NoRegisters,
}

/// Decodes raw holding-register words into a signed 64-bit value
/// (spec.md §4.2). For `count >= 2`, register order is little-endian:
/// `raw = (reg[1] << 16) | reg[0]`. For `count == 1`, `raw = reg[0]`.
pub fn decode_registers(registers: &[u16]) -> Result<i64, ProcessorError> {
    match registers.len() {
        0 => Err(ProcessorError::NoRegisters),
        1 => Ok(registers[0] as i64),
        _ => {
            let lo = registers[0] as u32;
            let hi = registers[1] as u32;
            Ok(((hi << 16) | lo) as i64)
        }
    }
}

/// `processed = round(raw * scale + offset, decimal_places)`. Returns
/// `None` when `scale == 0` (a configuration error, handled by the caller).
pub fn transform(raw: i64, scale: f64, offset: f64, decimal_places: u32) -> Option<f64> {
    if scale == 0.0 {
        return None;
    }
    let value = raw as f64 * scale + offset;
    let factor = 10f64.powi(decimal_places as i32);
    Some((value * factor).round() / factor)
}

/// One sample in a channel's rate history.
#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    raw: i64,
}

#[derive(Debug, Default)]
struct RateHistory {
    samples: VecDeque<RateSample>,
}

impl RateHistory {
    fn push_and_purge(&mut self, now: Instant, raw: i64, window: Duration) {
        self.samples.push_back(RateSample { at: now, raw });
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let oldest = self.samples.front().unwrap();
        let newest = self.samples.back().unwrap();
        let dt = newest.at.saturating_duration_since(oldest.at).as_secs_f64();
        if dt == 0.0 {
            return None;
        }

        let diff = if newest.raw >= oldest.raw {
            newest.raw - oldest.raw
        } else {
            // 32-bit counter wrap (spec.md §4.2).
            (COUNTER_32_MODULUS - oldest.raw) + newest.raw
        };

        Some(diff as f64 / dt)
    }
}

/// Stateful decode → transform → rate → quality → tag pipeline. Owns the
/// per-(device, channel) rate-history map; entries are pruned by the
/// configured rate window on every insertion.
#[derive(Default)]
pub struct ReadingProcessor {
    rate_histories: HashMap<(String, u8), RateHistory>,
}

impl ReadingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the rate history for a channel, e.g. because its register
    /// layout or scaling changed under a hot config update (spec.md §4.5,
    /// scenario 6 in §8).
    pub fn invalidate(&mut self, device_id: &str, channel_number: u8) {
        self.rate_histories
            .remove(&(device_id.to_string(), channel_number));
    }

    pub fn remove_device(&mut self, device_id: &str) {
        self.rate_histories.retain(|(id, _), _| id != device_id);
    }

    /// Processes a successful register read into a `Reading`.
    pub fn process_success(
        &mut self,
        device: &DeviceConfig,
        channel: &ChannelConfig,
        registers: &[u16],
        acquisition_duration: Duration,
        now: Instant,
    ) -> Reading {
        let tags = enrich_tags(device, channel);

        let raw = match decode_registers(registers) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    device_id = %device.id,
                    channel = channel.channel_number,
                    %err,
                    "register decode failed"
                );
                return failure_reading(
                    device,
                    channel,
                    acquisition_duration,
                    0,
                    Quality::ConfigurationError,
                    Some("no registers returned".to_string()),
                    tags,
                );
            }
        };

        let key = (device.id.clone(), channel.channel_number);
        let rate = {
            let history = self.rate_histories.entry(key).or_default();
            history.push_and_purge(now, raw, device.rate_window());
            history.rate()
        };

        let processed = transform(raw, channel.scale, channel.offset, channel.decimal_places);

        let (quality, error_message) = assign_quality(channel, device, raw, processed, rate);

        let processed_value = if matches!(
            quality,
            Quality::Bad | Quality::Timeout | Quality::DeviceFailure | Quality::ConfigurationError
        ) {
            None
        } else {
            processed
        };

        Reading {
            device_id: device.id.clone(),
            channel: channel.channel_number,
            timestamp: Utc::now(),
            acquisition_duration,
            raw_value: raw,
            processed_value,
            rate: if processed_value.is_some() { rate } else { None },
            quality,
            unit: channel.unit.clone(),
            tags,
            error_message,
        }
    }

    /// Builds a `Reading` for a channel whose read failed before the
    /// processor ever saw register data (spec.md §4.2, read-level
    /// failure mapping).
    pub fn process_failure(
        &mut self,
        device: &DeviceConfig,
        channel: &ChannelConfig,
        acquisition_duration: Duration,
        quality: Quality,
        error_message: String,
    ) -> Reading {
        let tags = enrich_tags(device, channel);
        failure_reading(
            device,
            channel,
            acquisition_duration,
            0,
            quality,
            Some(error_message),
            tags,
        )
    }
}

fn failure_reading(
    device: &DeviceConfig,
    channel: &ChannelConfig,
    acquisition_duration: Duration,
    raw: i64,
    quality: Quality,
    error_message: Option<String>,
    tags: TagMap,
) -> Reading {
    Reading {
        device_id: device.id.clone(),
        channel: channel.channel_number,
        timestamp: Utc::now(),
        acquisition_duration,
        raw_value: raw,
        processed_value: None,
        rate: None,
        quality,
        unit: channel.unit.clone(),
        tags,
        error_message,
    }
}

/// Ordered validation/quality rules (spec.md §4.2, first match wins).
fn assign_quality(
    channel: &ChannelConfig,
    device: &DeviceConfig,
    raw: i64,
    processed: Option<f64>,
    rate: Option<f64>,
) -> (Quality, Option<String>) {
    if channel.scale == 0.0 || processed.is_none() {
        return (
            Quality::ConfigurationError,
            Some("scale is zero or transform failed".to_string()),
        );
    }
    if (raw as f64) < channel.min || (raw as f64) > channel.max {
        return (
            Quality::Bad,
            Some(format!(
                "raw value {raw} outside [{}, {}]",
                channel.min, channel.max
            )),
        );
    }
    if let (Some(max_rate), Some(rate)) = (channel.max_rate_of_change, rate) {
        if rate.abs() > max_rate {
            return (
                Quality::Uncertain,
                Some(format!("rate {rate} exceeds max_rate_of_change {max_rate}")),
            );
        }
    }
    if raw >= device.overflow_threshold {
        return (Quality::Overflow, None);
    }
    (Quality::Good, None)
}

/// Tag enrichment per spec.md §4.2. Idempotent: running this twice with
/// the same inputs produces the same map because it always starts from
/// the channel's own tags rather than mutating a carried-forward map.
fn enrich_tags(device: &DeviceConfig, channel: &ChannelConfig) -> TagMap {
    let mut tags = channel.tags.clone();

    tags.entry("data_source".to_string())
        .or_insert_with(|| TagValue::from("adam_logger"));
    tags.entry("channel_name".to_string())
        .or_insert_with(|| TagValue::from(channel.name.clone()));
    if let Some(description) = &channel.description {
        tags.entry("channel_description".to_string())
            .or_insert_with(|| TagValue::from(description.clone()));
    }
    tags.entry("register_start".to_string())
        .or_insert_with(|| TagValue::from(channel.start_register as f64));
    tags.entry("register_count".to_string())
        .or_insert_with(|| TagValue::from(channel.register_count as f64));
    tags.entry("scale_factor".to_string())
        .or_insert_with(|| TagValue::from(channel.scale));
    if channel.offset != 0.0 {
        tags.entry("offset".to_string())
            .or_insert_with(|| TagValue::from(channel.offset));
    }
    tags.entry("device_type".to_string())
        .or_insert_with(|| TagValue::from(DEVICE_TYPE));
    tags.entry("timestamp_utc".to_string())
        .or_insert_with(|| TagValue::from(Utc::now().to_rfc3339()));

    for (key, value) in &device.tags {
        let device_key = format!("device_{key}");
        tags.entry(device_key).or_insert_with(|| value.clone());
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ChannelConfig, DeviceConfig, TagMap};

    fn channel() -> ChannelConfig {
        ChannelConfig {
            channel_number: 0,
            name: "prod_counter".to_string(),
            description: None,
            enabled: true,
            start_register: 0,
            register_count: 2,
            scale: 1.0,
            offset: 0.0,
            unit: "count".to_string(),
            decimal_places: 0,
            min: 0.0,
            max: 4_294_967_295.0,
            max_rate_of_change: None,
            tags: TagMap::default(),
        }
    }

    fn device() -> DeviceConfig {
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
            channels: vec![channel()],
        }
    }

    #[test]
    fn decode_count_two_is_little_endian_register_order() {
        // registers = [lo, hi]; raw = hi*2^16 + lo
        let raw = decode_registers(&[100, 0]).unwrap();
        assert_eq!(raw, 100);
        let raw = decode_registers(&[0, 1]).unwrap();
        assert_eq!(raw, 65_536);
    }

    #[test]
    fn decode_count_one_is_raw_register() {
        assert_eq!(decode_registers(&[42]).unwrap(), 42);
    }

    #[test]
    fn decode_empty_registers_errors() {
        assert!(decode_registers(&[]).is_err());
    }

    #[test]
    fn transform_rounds_to_decimal_places() {
        assert_eq!(transform(100, 1.0, 0.0, 0), Some(100.0));
        assert_eq!(transform(10, 0.333, 0.0, 2), Some(3.33));
    }

    #[test]
    fn transform_zero_scale_is_none() {
        assert_eq!(transform(100, 0.0, 0.0, 2), None);
    }

    #[test]
    fn rate_overflow_wrap_matches_spec_example() {
        let mut history = RateHistory::default();
        let t0 = Instant::now();
        history.push_and_purge(t0, 4_294_967_295, Duration::from_secs(300));
        history.push_and_purge(t0 + Duration::from_secs(1), 5, Duration::from_secs(300));
        assert_eq!(history.rate(), Some(6.0));
    }

    #[test]
    fn rate_needs_two_samples() {
        let mut history = RateHistory::default();
        history.push_and_purge(Instant::now(), 1, Duration::from_secs(300));
        assert_eq!(history.rate(), None);
    }

    #[test]
    fn single_counter_increment_scenario() {
        let mut processor = ReadingProcessor::new();
        let dev = device();
        let chan = channel();
        let t0 = Instant::now();

        let r1 = processor.process_success(&dev, &chan, &[100, 0], Duration::from_millis(5), t0);
        assert_eq!(r1.raw_value, 100);
        assert_eq!(r1.processed_value, Some(100.0));
        assert_eq!(r1.rate, None);
        assert_eq!(r1.quality, Quality::Good);

        let r2 = processor.process_success(
            &dev,
            &chan,
            &[200, 0],
            Duration::from_millis(5),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(r2.raw_value, 200);
        assert_eq!(r2.rate, Some(100.0));
        assert_eq!(r2.quality, Quality::Good);
    }

    #[test]
    fn counter_wrap_scenario_marks_overflow() {
        let mut processor = ReadingProcessor::new();
        let mut dev = device();
        dev.overflow_threshold = 4_294_967_295;
        let chan = channel();
        let t0 = Instant::now();

        let r1 = processor.process_success(
            &dev,
            &chan,
            &[0xFFFF, 0xFFFF],
            Duration::from_millis(5),
            t0,
        );
        assert_eq!(r1.quality, Quality::Overflow);

        let r2 = processor.process_success(
            &dev,
            &chan,
            &[5, 0],
            Duration::from_millis(5),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(r2.rate, Some(6.0));
        assert_eq!(r2.quality, Quality::Good);
    }

    #[test]
    fn out_of_range_raw_is_bad_but_still_processed() {
        let mut processor = ReadingProcessor::new();
        let dev = device();
        let mut chan = channel();
        chan.min = 0.0;
        chan.max = 1000.0;

        let reading =
            processor.process_success(&dev, &chan, &[2000, 0], Duration::from_millis(5), Instant::now());
        assert_eq!(reading.quality, Quality::Bad);
        assert_eq!(reading.processed_value, Some(2000.0));
    }

    #[test]
    fn zero_scale_is_configuration_error_without_processed_value() {
        let mut processor = ReadingProcessor::new();
        let dev = device();
        let mut chan = channel();
        chan.scale = 0.0;

        let reading =
            processor.process_success(&dev, &chan, &[1, 0], Duration::from_millis(5), Instant::now());
        assert_eq!(reading.quality, Quality::ConfigurationError);
        assert_eq!(reading.processed_value, None);
    }

    #[test]
    fn tag_enrichment_is_idempotent() {
        let dev = device();
        let chan = channel();
        let first = enrich_tags(&dev, &chan);
        let second = enrich_tags(&dev, &chan);
        assert_eq!(first.len(), second.len());
        assert_eq!(first.get("channel_name"), second.get("channel_name"));
        assert_eq!(first.get("data_source"), Some(&TagValue::from("adam_logger")));
    }

    #[test]
    fn device_tags_are_prefixed_without_overwriting_existing_keys() {
        let mut dev = device();
        dev.tags.insert("site".to_string(), TagValue::from("plant-1"));
        let chan = channel();
        let tags = enrich_tags(&dev, &chan);
        assert_eq!(tags.get("device_site"), Some(&TagValue::from("plant-1")));
    }

    #[test]
    fn invalidate_resets_rate_history() {
        let mut processor = ReadingProcessor::new();
        let dev = device();
        let chan = channel();
        let t0 = Instant::now();
        processor.process_success(&dev, &chan, &[100, 0], Duration::from_millis(1), t0);
        processor.invalidate(&dev.id, chan.channel_number);

        let reading = processor.process_success(
            &dev,
            &chan,
            &[200, 0],
            Duration::from_millis(1),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(reading.rate, None);
    }
}
