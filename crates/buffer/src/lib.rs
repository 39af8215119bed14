#![allow(dead_code)]

//! `BatchSink`: an in-memory queue of records destined for the
//! time-series sink, with size/time flush triggers, a single-flight
//! flush guard, and retry-with-jitter on failed flushes (spec.md §4.7).
//!
//! Durability across process restarts is out of scope (the buffer is
//! best-effort, in memory only); all persistence is delegated to the
//! sink itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sink::{SinkError, TimeSeriesRecord, TimeSeriesSink};

const DEFAULT_HARD_CAP: usize = 10_000;

#[derive(Debug, Clone)]
pub struct BatchSinkConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub hard_cap: usize,
    pub max_retries_per_flush: u32,
    pub retry_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for BatchSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            hard_cap: DEFAULT_HARD_CAP,
            max_retries_per_flush: 3,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("flush exceeded its deadline")]
    DeadlineExceeded,
}

/// Point-in-time view of the buffer's own health, reported separately
/// from device health (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub pending_count: usize,
    pub dropped_count: u64,
    pub last_error: Option<String>,
}

struct State {
    queue: VecDeque<TimeSeriesRecord>,
    last_flush_at: Instant,
    last_error: Option<String>,
}

/// Buffers records in memory and flushes them to a `TimeSeriesSink` in
/// batches. At most one flush runs at a time.
pub struct BatchSink {
    sink: Arc<dyn TimeSeriesSink>,
    config: BatchSinkConfig,
    state: Mutex<State>,
    flush_lock: Mutex<()>,
    dropped_count: AtomicU64,
}

impl BatchSink {
    pub fn new(sink: Arc<dyn TimeSeriesSink>, config: BatchSinkConfig) -> Self {
        Self {
            sink,
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                last_flush_at: Instant::now(),
                last_error: None,
            }),
            flush_lock: Mutex::new(()),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Enqueues a record, dropping it (and counting the drop) if the
    /// queue is already at its hard cap.
    pub async fn enqueue(&self, record: TimeSeriesRecord) {
        let mut state = self.state.lock().await;
        if state.queue.len() >= self.config.hard_cap {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            warn!("buffer at hard cap, dropping record");
            return;
        }
        state.queue.push_back(record);
    }

    /// Flushes once if a size or time trigger has fired and no other
    /// flush is currently in progress. Safe to call on every tick; it's
    /// a no-op when neither trigger has fired or a flush is already
    /// in flight.
    pub async fn maybe_flush(&self) {
        let should_flush = {
            let state = self.state.lock().await;
            state.queue.len() >= self.config.batch_size
                || (!state.queue.is_empty()
                    && state.last_flush_at.elapsed() >= self.config.batch_timeout)
        };
        if !should_flush {
            return;
        }

        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("flush already in flight, skipping tick");
            return;
        };
        self.flush_locked(false, Instant::now() + self.config.batch_timeout)
            .await;
    }

    /// Drains the queue synchronously up to `deadline`, used on
    /// shutdown. Waits for any in-flight flush to finish first.
    pub async fn flush(&self, deadline: Instant) -> Result<usize, BufferError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked(true, deadline).await;

        let remaining = self.state.lock().await.queue.len();
        if remaining > 0 && Instant::now() >= deadline {
            return Err(BufferError::DeadlineExceeded);
        }
        Ok(remaining)
    }

    async fn flush_locked(&self, force: bool, deadline: Instant) {
        loop {
            let batch: Vec<TimeSeriesRecord> = {
                let mut state = self.state.lock().await;
                if state.queue.is_empty() {
                    break;
                }
                let take = self.config.batch_size.min(state.queue.len());
                state.queue.drain(..take).collect()
            };

            if batch.is_empty() {
                break;
            }

            match self.write_with_retry(&batch, deadline).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.last_flush_at = Instant::now();
                    state.last_error = None;
                }
                Err(err) => {
                    let mut state = self.state.lock().await;
                    state.last_error = Some(err.to_string());
                    if state.queue.len() >= self.config.hard_cap {
                        self.dropped_count
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        warn!(dropped = batch.len(), "flush failed at hard cap, dropping batch");
                    } else {
                        for record in batch.into_iter().rev() {
                            state.queue.push_front(record);
                        }
                    }
                    break;
                }
            }

            if !force && Instant::now() >= deadline {
                break;
            }
        }
    }

    async fn write_with_retry(
        &self,
        batch: &[TimeSeriesRecord],
        deadline: Instant,
    ) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            match self.sink.write_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.config.max_retries_per_flush || Instant::now() >= deadline {
                        return Err(err);
                    }
                    let delay = self.backoff_with_jitter(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_backoff_ms
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(self.config.retry_max_backoff_ms)
            .min(self.config.retry_max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        Duration::from_millis(base + jitter)
    }

    pub async fn health(&self) -> SinkHealth {
        let state = self.state.lock().await;
        SinkHealth {
            pending_count: state.queue.len(),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sink::RecordingSink;

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
    async fn size_trigger_flushes_once_batch_size_reached() {
        let recording = Arc::new(RecordingSink::new());
        let sink_under_test = BatchSink::new(
            recording.clone(),
            BatchSinkConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.maybe_flush().await;

        assert_eq!(recording.total_records(), 2);
        assert_eq!(sink_under_test.pending_count().await, 0);
    }

    #[tokio::test]
    async fn below_trigger_does_not_flush() {
        let recording = Arc::new(RecordingSink::new());
        let sink_under_test = BatchSink::new(
            recording.clone(),
            BatchSinkConfig {
                batch_size: 10,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.maybe_flush().await;
        assert_eq!(recording.total_records(), 0);
        assert_eq!(sink_under_test.pending_count().await, 1);
    }

    #[tokio::test]
    async fn failed_flush_requeues_to_head() {
        let recording = Arc::new(RecordingSink::new());
        recording.fail_next_write();
        let sink_under_test = BatchSink::new(
            recording.clone(),
            BatchSinkConfig {
                batch_size: 1,
                max_retries_per_flush: 0,
                retry_backoff_ms: 1,
                ..Default::default()
            },
        );
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.maybe_flush().await;

        assert_eq!(recording.total_records(), 0);
        assert_eq!(sink_under_test.pending_count().await, 1);
        let health = sink_under_test.health().await;
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn hard_cap_drops_and_counts_instead_of_requeue() {
        let recording = Arc::new(RecordingSink::new());
        recording.fail_next_write();
        let sink_under_test = BatchSink::new(
            recording.clone(),
            BatchSinkConfig {
                batch_size: 1,
                hard_cap: 0,
                max_retries_per_flush: 0,
                retry_backoff_ms: 1,
                ..Default::default()
            },
        );
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.maybe_flush().await;

        assert_eq!(sink_under_test.pending_count().await, 0);
        let health = sink_under_test.health().await;
        assert_eq!(health.dropped_count, 1);
    }

    #[tokio::test]
    async fn enqueue_past_hard_cap_drops_new_records() {
        let recording = Arc::new(RecordingSink::new());
        let sink_under_test = BatchSink::new(
            recording,
            BatchSinkConfig {
                hard_cap: 1,
                ..Default::default()
            },
        );
        sink_under_test.enqueue(sample_record()).await;
        sink_under_test.enqueue(sample_record()).await;
        assert_eq!(sink_under_test.pending_count().await, 1);
        assert_eq!(sink_under_test.health().await.dropped_count, 1);
    }

    #[tokio::test]
    async fn shutdown_flush_drains_whole_queue_within_deadline() {
        let recording = Arc::new(RecordingSink::new());
        let sink_under_test = BatchSink::new(
            recording.clone(),
            BatchSinkConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            sink_under_test.enqueue(sample_record()).await;
        }
        let remaining = sink_under_test
            .flush(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(recording.total_records(), 5);
    }
}
