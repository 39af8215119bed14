#![allow(dead_code)]

//! The external time-series collaborator contract (spec.md §4.7/§6). The
//! concrete driver (Kafka, InfluxDB, whatever the deployment uses) is out
//! of scope; this crate defines the shape every driver must satisfy and
//! ships test doubles for exercising the rest of the pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use types::{Quality, Reading, TagValue};

const DEFAULT_MEASUREMENT: &str = "adam_counters";

#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink protocol error: {0}")]
    Protocol(String),
}

/// One row destined for the time-series store (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    pub measurement: String,
    pub tags: HashMap<String, String>,
    pub raw_value: i64,
    pub processed_value: f64,
    pub rate_of_change: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TimeSeriesRecord {
    /// Builds a record from a reading, stringifying tags for drivers that
    /// can't preserve the numeric/string distinction and falling back to
    /// `raw_value` when `processed_value` is absent (spec.md §6).
    pub fn from_reading(reading: &Reading, global_tags: &HashMap<String, TagValue>) -> Self {
        let mut tags = HashMap::with_capacity(reading.tags.len() + global_tags.len() + 3);
        tags.insert("device_id".to_string(), reading.device_id.clone());
        tags.insert("channel".to_string(), reading.channel.to_string());
        tags.insert("quality".to_string(), format!("{:?}", reading.quality));
        for (key, value) in &reading.tags {
            tags.insert(key.clone(), stringify(value));
        }
        for (key, value) in global_tags {
            tags.entry(key.clone()).or_insert_with(|| stringify(value));
        }

        let processed_value = reading.processed_value.unwrap_or(reading.raw_value as f64);

        Self {
            measurement: DEFAULT_MEASUREMENT.to_string(),
            tags,
            raw_value: reading.raw_value,
            processed_value,
            rate_of_change: reading.rate,
            timestamp: reading.timestamp,
        }
    }
}

fn stringify(value: &TagValue) -> String {
    match value {
        TagValue::String(s) => s.clone(),
        TagValue::Number(n) => n.to_string(),
    }
}

/// Whether a reading is eligible for the sink under the default policy
/// (Good-only) or a widened one (spec.md §4.7, Open Question #3).
pub fn is_forwardable(quality: Quality, forward_qualities: &[Quality]) -> bool {
    if forward_qualities.is_empty() {
        quality == Quality::Good
    } else {
        forward_qualities.contains(&quality)
    }
}

/// The collaborator contract the core depends on (spec.md §6): write a
/// batch, and report liveness.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_batch(&self, records: &[TimeSeriesRecord]) -> Result<(), SinkError>;
    async fn ping(&self) -> Result<(), SinkError>;
}

/// A sink that logs batches instead of shipping them anywhere. Useful as
/// a default when no concrete driver is wired up.
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

#[async_trait]
impl TimeSeriesSink for LoggingSink {
    async fn write_batch(&self, records: &[TimeSeriesRecord]) -> Result<(), SinkError> {
        info!(count = records.len(), "logging sink received batch");
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// A sink that records every batch it receives in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    batches: std::sync::Mutex<Vec<Vec<TimeSeriesRecord>>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<TimeSeriesRecord>> {
        self.batches.lock().expect("recording sink mutex poisoned").clone()
    }

    pub fn total_records(&self) -> usize {
        self.batches().iter().map(|batch| batch.len()).sum()
    }
}

#[async_trait]
impl TimeSeriesSink for RecordingSink {
    async fn write_batch(&self, records: &[TimeSeriesRecord]) -> Result<(), SinkError> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(SinkError::Unavailable("forced failure".to_string()));
        }
        self.batches
            .lock()
            .expect("recording sink mutex poisoned")
            .push(records.to_vec());
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_reading() -> Reading {
        Reading {
            device_id: "D1".to_string(),
            channel: 0,
            timestamp: Utc::now(),
            acquisition_duration: Duration::from_millis(5),
            raw_value: 100,
            processed_value: Some(100.0),
            rate: Some(10.0),
            quality: Quality::Good,
            unit: "count".to_string(),
            tags: HashMap::new(),
            error_message: None,
        }
    }

    #[test]
    fn record_falls_back_to_raw_when_processed_missing() {
        let mut reading = sample_reading();
        reading.processed_value = None;
        let record = TimeSeriesRecord::from_reading(&reading, &HashMap::new());
        assert_eq!(record.processed_value, 100.0);
    }

    #[test]
    fn record_carries_core_tags() {
        let reading = sample_reading();
        let record = TimeSeriesRecord::from_reading(&reading, &HashMap::new());
        assert_eq!(record.tags.get("device_id"), Some(&"D1".to_string()));
        assert_eq!(record.tags.get("channel"), Some(&"0".to_string()));
        assert_eq!(record.measurement, "adam_counters");
    }

    #[test]
    fn global_tags_do_not_overwrite_reading_tags() {
        let mut reading = sample_reading();
        reading.tags.insert("site".to_string(), TagValue::from("plant-a"));
        let mut global = HashMap::new();
        global.insert("site".to_string(), TagValue::from("fallback"));
        let record = TimeSeriesRecord::from_reading(&reading, &global);
        assert_eq!(record.tags.get("site"), Some(&"plant-a".to_string()));
    }

    #[test]
    fn default_policy_forwards_good_only() {
        assert!(is_forwardable(Quality::Good, &[]));
        assert!(!is_forwardable(Quality::Bad, &[]));
    }

    #[test]
    fn widened_policy_forwards_configured_qualities() {
        let widened = [Quality::Good, Quality::Uncertain];
        assert!(is_forwardable(Quality::Uncertain, &widened));
        assert!(!is_forwardable(Quality::Bad, &widened));
    }

    #[tokio::test]
    async fn recording_sink_stores_batches_until_failure() {
        let sink = RecordingSink::new();
        let record = TimeSeriesRecord::from_reading(&sample_reading(), &HashMap::new());
        sink.write_batch(&[record.clone()]).await.unwrap();
        assert_eq!(sink.total_records(), 1);

        sink.fail_next_write();
        assert!(sink.write_batch(&[record]).await.is_err());
        assert_eq!(sink.total_records(), 1);
    }
}
