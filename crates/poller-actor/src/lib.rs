#![allow(dead_code)]

//! `Scheduler`: the acquisition and health loops that drive the whole
//! service (spec.md §4.4).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use buffer::BatchSink;
use health::Outcome;
use modbus_client::ClientError;
use processor::ReadingProcessor;
use registry::DeviceRegistry;
use sink::{is_forwardable, TimeSeriesRecord};
use streams::StreamHub;
use types::{ChannelConfig, DeviceConfig, Quality};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
    pub max_concurrent_devices: usize,
    pub forward_qualities: Vec<Quality>,
}

/// Join handles for the two loops `Scheduler::spawn` starts.
pub struct SchedulerHandles {
    pub acquisition: tokio::task::JoinHandle<()>,
    pub health: tokio::task::JoinHandle<()>,
}

/// Drives device acquisition and health probing for the service's
/// lifetime. Cheap to clone: every field is an `Arc` or a handle to
/// shared state.
#[derive(Clone)]
pub struct Scheduler {
    registry: DeviceRegistry,
    streams: StreamHub,
    processor: Arc<Mutex<ReadingProcessor>>,
    sink: Arc<BatchSink>,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(
        registry: DeviceRegistry,
        streams: StreamHub,
        processor: Arc<Mutex<ReadingProcessor>>,
        sink: Arc<BatchSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            streams,
            processor,
            sink,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn spawn(&self, cancel: CancellationToken) -> SchedulerHandles {
        let acquisition = {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_acquisition_loop(cancel).await })
        };
        let health = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_health_loop(cancel).await })
        };
        SchedulerHandles { acquisition, health }
    }

    async fn run_acquisition_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("acquisition loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.run_acquisition_tick(&cancel).await;
                    let elapsed = started.elapsed();
                    if elapsed > self.config.poll_interval {
                        warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                            "acquisition tick overran its period"
                        );
                    }
                }
            }
        }
    }

    async fn run_health_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("health loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.registry
                        .probe_all_health(&cancel, self.config.max_concurrent_devices)
                        .await;
                }
            }
        }
    }

    /// One acquisition tick: fan out a read job per device, skipping any
    /// device whose previous tick's job hasn't finished yet so at most
    /// one acquisition per device is ever outstanding (spec.md §4.4).
    async fn run_acquisition_tick(&self, cancel: &CancellationToken) {
        let devices = self.registry.snapshot().await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_devices.max(1)));
        let mut join_set = JoinSet::new();

        for (device_cfg, session) in devices {
            if cancel.is_cancelled() {
                break;
            }

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(device_cfg.id.clone()) {
                    debug!(device_id = %device_cfg.id, "previous acquisition still in flight, coalescing tick");
                    continue;
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let scheduler = self.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;
                scheduler.poll_device(&device_cfg, &session, &cancel).await;
                scheduler.in_flight.lock().await.remove(&device_cfg.id);
            });

            if join_set.len() >= self.config.max_concurrent_devices.max(1) {
                join_set.join_next().await;
            }
        }

        while join_set.join_next().await.is_some() {}

        self.sink.maybe_flush().await;
    }

    /// Reads every enabled channel of one device sequentially, feeding
    /// each outcome to the processor, the streams, the sink, and the
    /// device's health tracker.
    async fn poll_device(
        &self,
        device: &DeviceConfig,
        session: &modbus_client::DeviceSession,
        cancel: &CancellationToken,
    ) {
        for channel in device.channels.iter().filter(|c| c.enabled) {
            if cancel.is_cancelled() {
                return;
            }
            self.poll_channel(device, channel, session, cancel).await;
        }
    }

    async fn poll_channel(
        &self,
        device: &DeviceConfig,
        channel: &ChannelConfig,
        session: &modbus_client::DeviceSession,
        cancel: &CancellationToken,
    ) {
        let outcome = session
            .read_holding_registers(channel.start_register, channel.register_count as u16, cancel)
            .await;

        let reading = match outcome {
            Ok(read) => {
                metrics::counter!("adam_reads_total", "device_id" => device.id.clone(), "outcome" => "success").increment(1);
                metrics::histogram!("adam_read_latency_ms", "device_id" => device.id.clone())
                    .record(read.duration.as_secs_f64() * 1000.0);

                let mut processor = self.processor.lock().await;
                let reading = processor.process_success(
                    device,
                    channel,
                    &read.data,
                    read.duration,
                    Instant::now(),
                );
                self.registry
                    .record_outcome(
                        &device.id,
                        Outcome::Success {
                            latency: read.duration,
                        },
                    )
                    .await;
                reading
            }
            Err(ClientError::Cancelled) => return,
            Err(err) => {
                metrics::counter!("adam_reads_total", "device_id" => device.id.clone(), "outcome" => "failure").increment(1);

                let quality = client_error_to_quality(&err);
                let mut processor = self.processor.lock().await;
                let reading = processor.process_failure(
                    device,
                    channel,
                    Duration::ZERO,
                    quality,
                    err.to_string(),
                );
                self.registry
                    .record_outcome(
                        &device.id,
                        Outcome::Failure {
                            error_message: err.to_string(),
                            disconnected: matches!(
                                err,
                                ClientError::ConnectionFailed(_) | ClientError::Closed
                            ),
                        },
                    )
                    .await;
                reading
            }
        };

        let quality = reading.quality;
        self.streams.publish_reading(reading.clone());

        if is_forwardable(quality, &self.config.forward_qualities) {
            let record = TimeSeriesRecord::from_reading(&reading, &device.tags);
            self.sink.enqueue(record).await;
            self.sink.maybe_flush().await;
        }
    }
}

/// Maps a read-level session failure to a reading quality, per the
/// read-level failure rules of spec.md §4.2.
fn client_error_to_quality(err: &ClientError) -> Quality {
    match err {
        ClientError::Timeout { .. } => Quality::Timeout,
        ClientError::ConnectionFailed(_)
        | ClientError::ProtocolError(_)
        | ClientError::Closed
        | ClientError::InvalidAddress(_, _)
        | ClientError::AddressOverflow => Quality::DeviceFailure,
        ClientError::Cancelled => Quality::DeviceFailure,
    }
}
