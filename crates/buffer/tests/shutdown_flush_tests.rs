use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use buffer::{BatchSink, BatchSinkConfig};
use chrono::Utc;
use sink::{SinkError, TimeSeriesRecord, TimeSeriesSink};

/// A sink that never succeeds, so a shutdown flush has no choice but to
/// exhaust its deadline.
#[derive(Default)]
struct AlwaysFailsSink;

#[async_trait]
impl TimeSeriesSink for AlwaysFailsSink {
    async fn write_batch(&self, _records: &[TimeSeriesRecord]) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("permanently down".to_string()))
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("permanently down".to_string()))
    }
}

fn sample_record() -> TimeSeriesRecord {
    TimeSeriesRecord {
        measurement: "adam_counters".to_string(),
        tags: Default::default(),
        raw_value: 1,
        processed_value: 1.0,
        rate_of_change: None,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn shutdown_flush_against_a_dead_sink_exceeds_its_deadline() {
    let sink_under_test = BatchSink::new(
        Arc::new(AlwaysFailsSink),
        BatchSinkConfig {
            batch_size: 1,
            max_retries_per_flush: 0,
            retry_backoff_ms: 1,
            ..Default::default()
        },
    );
    sink_under_test.enqueue(sample_record()).await;

    // A deadline already in the past: the sink never succeeds, so the
    // flush must report it couldn't drain the queue in time.
    let result = sink_under_test
        .flush(Instant::now() - Duration::from_millis(1))
        .await;
    assert!(result.is_err());
    assert_eq!(sink_under_test.pending_count().await, 1);
}
