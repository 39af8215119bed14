#![allow(dead_code)]

//! `Orchestrator`: the service facade. Wires the registry, stream hub,
//! processor, batch sink, and scheduler together and exposes the
//! lifecycle and mutation operations of spec.md §4.8.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use buffer::{BatchSink, BatchSinkConfig};
use poller_actor::{Scheduler, SchedulerConfig, SchedulerHandles};
use processor::ReadingProcessor;
use registry::{DeviceRegistry, RegistryError};
use sink::TimeSeriesSink;
use streams::{HealthSubscription, ReadingSubscription, StreamHub};
use types::{DeviceConfig, Health, ServiceConfig};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator has been stopped; create a new instance to restart")]
    AlreadyStopped,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

enum RunState {
    NotStarted,
    Running {
        cancel: CancellationToken,
        handles: SchedulerHandles,
    },
    Stopped,
}

/// Default bound for joining the acquisition/health loops on shutdown
/// before they're abandoned (spec.md §5).
const DEFAULT_LOOP_JOIN_GRACE: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    registry: DeviceRegistry,
    streams: StreamHub,
    processor: Arc<Mutex<ReadingProcessor>>,
    batch_sink: Arc<BatchSink>,
    scheduler: Scheduler,
    state: Mutex<RunState>,
    loop_join_grace: Duration,
    sink_flush_deadline: Duration,
}

impl Orchestrator {
    pub fn new(service: ServiceConfig, sink: Arc<dyn TimeSeriesSink>) -> Self {
        let streams = StreamHub::new(service.data_buffer_size);
        let registry = DeviceRegistry::new(service.max_consecutive_failures, streams.clone());
        let processor = Arc::new(Mutex::new(ReadingProcessor::new()));
        let batch_sink = Arc::new(BatchSink::new(
            sink,
            BatchSinkConfig {
                batch_size: service.batch_size,
                batch_timeout: service.batch_timeout(),
                ..BatchSinkConfig::default()
            },
        ));
        let scheduler = Scheduler::new(
            registry.clone(),
            streams.clone(),
            processor.clone(),
            batch_sink.clone(),
            SchedulerConfig {
                poll_interval: service.poll_interval(),
                health_check_interval: service.health_check_interval(),
                max_concurrent_devices: service.max_concurrent_devices,
                forward_qualities: Vec::new(),
            },
        );

        Self {
            registry,
            streams,
            processor,
            batch_sink,
            scheduler,
            state: Mutex::new(RunState::NotStarted),
            loop_join_grace: DEFAULT_LOOP_JOIN_GRACE,
            sink_flush_deadline: service.batch_timeout(),
        }
    }

    /// Starts the acquisition and health loops. Idempotent while
    /// running; returns an error if the orchestrator was already
    /// stopped once (spec.md §4.8).
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        match &*state {
            RunState::Running { .. } => return Ok(()),
            RunState::Stopped => return Err(OrchestratorError::AlreadyStopped),
            RunState::NotStarted => {}
        }

        let cancel = CancellationToken::new();
        let handles = self.scheduler.spawn(cancel.clone());
        *state = RunState::Running { cancel, handles };
        Ok(())
    }

    /// Cancels both loops, waits for them within a bounded grace window
    /// (abandoning stragglers past it), flushes the sink within its own
    /// deadline, and closes every session (spec.md §4.8).
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let (cancel, mut handles) = match std::mem::replace(&mut *state, RunState::Stopped) {
            RunState::Running { cancel, handles } => (cancel, handles),
            _ => return,
        };
        drop(state);

        cancel.cancel();
        let joined = tokio::time::timeout(self.loop_join_grace, async {
            let _ = (&mut handles.acquisition).await;
            let _ = (&mut handles.health).await;
        })
        .await;
        if joined.is_err() {
            warn!("scheduler loops did not join within grace window, abandoning");
            handles.acquisition.abort();
            handles.health.abort();
        }

        let deadline = Instant::now() + self.sink_flush_deadline;
        if let Err(err) = self.batch_sink.flush(deadline).await {
            let health = self.batch_sink.health().await;
            warn!(
                error = %err,
                dropped = health.dropped_count,
                pending = health.pending_count,
                "sink flush did not complete within shutdown deadline"
            );
        }

        for (_, session) in self.registry.snapshot().await {
            session.close().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.state.lock().await, RunState::Running { .. })
    }

    pub fn subscribe_readings(&self) -> ReadingSubscription {
        self.streams.subscribe_readings()
    }

    pub fn subscribe_health(&self) -> HealthSubscription {
        self.streams.subscribe_health()
    }

    pub async fn get_health(&self, device_id: &str) -> Option<Health> {
        self.registry.get_health(device_id).await
    }

    pub async fn get_all_health(&self) -> Vec<Health> {
        self.registry.get_all_health().await
    }

    pub async fn add_device(&self, cfg: DeviceConfig) -> Result<(), OrchestratorError> {
        self.registry.add_device(cfg).await?;
        Ok(())
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<(), OrchestratorError> {
        self.registry.remove_device(device_id).await?;
        Ok(())
    }

    /// Updates a device's config and invalidates rate history for any
    /// channel whose register layout or scaling changed (spec.md §4.5).
    pub async fn update_device(&self, cfg: DeviceConfig) -> Result<(), OrchestratorError> {
        let device_id = cfg.id.clone();
        let invalidated = self.registry.update_device(cfg).await?;
        if !invalidated.is_empty() {
            let mut processor = self.processor.lock().await;
            for channel_number in invalidated {
                processor.invalidate(&device_id, channel_number);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sink::RecordingSink;
    use types::{ChannelConfig, TagMap};

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

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 50,
            max_retries: 0,
            retry_delay_ms: 10,
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

    fn test_service_config() -> ServiceConfig {
        ServiceConfig {
            poll_interval_ms: 100,
            health_check_interval_ms: 5_000,
            max_concurrent_devices: 4,
            data_buffer_size: 16,
            batch_size: 10,
            batch_timeout_ms: 200,
            max_consecutive_failures: 3,
            device_timeout_ms: 3_000,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_after_stop_errors_on_restart() {
        let orchestrator = Orchestrator::new(test_service_config(), Arc::new(RecordingSink::new()));
        assert!(!orchestrator.is_running().await);
        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.is_running().await);

        orchestrator.stop().await;
        assert!(!orchestrator.is_running().await);
        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyStopped));
    }

    #[tokio::test]
    async fn add_remove_update_device_round_trip() {
        let orchestrator = Orchestrator::new(test_service_config(), Arc::new(RecordingSink::new()));
        orchestrator.add_device(device("D1")).await.unwrap();
        assert!(orchestrator.get_health("D1").await.is_some());

        let mut updated = device("D1");
        updated.channels[0].scale = 2.0;
        orchestrator.update_device(updated).await.unwrap();
        assert!(orchestrator.get_health("D1").await.is_some());

        orchestrator.remove_device("D1").await.unwrap();
        assert!(orchestrator.remove_device("D1").await.is_err());
    }
}
