#![allow(dead_code)]

//! `DeviceRegistry`: owns device sessions, configs, and health trackers
//! under a single-writer/multi-reader discipline (spec.md §4.5). Lock
//! order across the service is fixed at registry → session → tracker.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use health::{HealthTracker, Outcome};
use modbus_client::{ClientConfig, ClientError, DeviceSession};
use streams::StreamHub;
use types::{ConfigError, DeviceConfig, Health};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} already registered")]
    DuplicateDevice(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct DeviceEntry {
    config: DeviceConfig,
    session: Arc<DeviceSession>,
    tracker: Arc<Mutex<HealthTracker>>,
}

/// Owns every known device. Cheap to clone: all clones share the same
/// backing map, so a clone can be handed to a spawned probe task.
#[derive(Clone)]
pub struct DeviceRegistry {
    entries: Arc<RwLock<HashMap<String, DeviceEntry>>>,
    max_consecutive_failures: u32,
    streams: StreamHub,
}

impl DeviceRegistry {
    pub fn new(max_consecutive_failures: u32, streams: StreamHub) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_consecutive_failures,
            streams,
        }
    }

    /// Validates, rejects duplicates, opens a session (lazily — the
    /// first read dials), and publishes the initial `Unknown` health
    /// record (spec.md §4.5).
    pub async fn add_device(&self, cfg: DeviceConfig) -> Result<(), RegistryError> {
        cfg.validate()?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(&cfg.id) {
            return Err(RegistryError::DuplicateDevice(cfg.id));
        }

        let session = Arc::new(DeviceSession::new(to_client_config(&cfg), cfg.unit_id));
        let tracker = HealthTracker::new(cfg.id.clone(), self.max_consecutive_failures);
        let initial_health = tracker.snapshot();

        entries.insert(
            cfg.id.clone(),
            DeviceEntry {
                config: cfg,
                session,
                tracker: Arc::new(Mutex::new(tracker)),
            },
        );
        drop(entries);

        self.streams.publish_health(initial_health);
        Ok(())
    }

    /// Removes a device so future ticks won't see it, closes its
    /// session, and publishes a terminal offline health record.
    pub async fn remove_device(&self, id: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        drop(entries);

        entry.session.close().await;
        let terminal = entry.tracker.lock().await.terminal();
        self.streams.publish_health(terminal);
        Ok(())
    }

    /// Atomic remove+add that preserves read counters and the
    /// last-success baseline. Returns the channel numbers whose
    /// register layout or scaling changed, so the caller can invalidate
    /// their rate history in the processor (spec.md §4.5).
    pub async fn update_device(&self, cfg: DeviceConfig) -> Result<Vec<u8>, RegistryError> {
        cfg.validate()?;
        let mut entries = self.entries.write().await;
        let old = entries
            .remove(&cfg.id)
            .ok_or_else(|| RegistryError::NotFound(cfg.id.clone()))?;
        old.session.close().await;

        let invalidated = invalidated_channels(&old.config, &cfg);
        let carried = old
            .tracker
            .lock()
            .await
            .carry_forward(self.max_consecutive_failures);
        let snapshot = carried.snapshot();
        let session = Arc::new(DeviceSession::new(to_client_config(&cfg), cfg.unit_id));

        entries.insert(
            cfg.id.clone(),
            DeviceEntry {
                config: cfg,
                session,
                tracker: Arc::new(Mutex::new(carried)),
            },
        );
        drop(entries);

        self.streams.publish_health(snapshot);
        Ok(invalidated)
    }

    /// A cheap read-locked view of every device's config and session,
    /// for the scheduler's per-tick fan-out.
    pub async fn snapshot(&self) -> Vec<(DeviceConfig, Arc<DeviceSession>)> {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| (entry.config.clone(), entry.session.clone()))
            .collect()
    }

    pub async fn get_health(&self, id: &str) -> Option<Health> {
        let tracker = {
            let entries = self.entries.read().await;
            entries.get(id)?.tracker.clone()
        };
        Some(tracker.lock().await.snapshot())
    }

    pub async fn get_all_health(&self) -> Vec<Health> {
        let trackers: Vec<Arc<Mutex<HealthTracker>>> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.tracker.clone())
            .collect();
        let mut out = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            out.push(tracker.lock().await.snapshot());
        }
        out
    }

    /// Feeds an acquisition or probe outcome through the device's
    /// tracker and republishes its health (spec.md §4.3).
    pub async fn record_outcome(&self, id: &str, outcome: Outcome) {
        let tracker = {
            let entries = self.entries.read().await;
            entries.get(id).map(|entry| entry.tracker.clone())
        };
        if let Some(tracker) = tracker {
            let health = tracker.lock().await.record(&outcome);
            self.streams.publish_health(health);
        }
    }

    /// Runs a connectivity probe per device, bounded by `max_concurrency`
    /// (spec.md §4.4 health loop), grounded on the same
    /// semaphore-gated `JoinSet` fan-out used elsewhere for bounded
    /// concurrency.
    pub async fn probe_all_health(&self, cancel: &CancellationToken, max_concurrency: usize) {
        let snapshot = self.snapshot().await;
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (cfg, session) in snapshot {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let cancel = cancel.clone();
            let registry = self.clone();
            let device_id = cfg.id.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let outcome = match session.test_connectivity(&cancel).await {
                    Ok(latency) => Outcome::Success { latency },
                    Err(ClientError::Cancelled) => return,
                    Err(err) => Outcome::Failure {
                        disconnected: matches!(
                            err,
                            ClientError::ConnectionFailed(_) | ClientError::Closed
                        ),
                        error_message: err.to_string(),
                    },
                };
                registry.record_outcome(&device_id, outcome).await;
            });

            if join_set.len() >= max_concurrency.max(1) {
                if let Err(err) = join_set.join_next().await.unwrap_or(Ok(())) {
                    warn!(error = %err, "health probe task panicked");
                }
            }
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "health probe task panicked");
            }
        }
    }
}

fn to_client_config(cfg: &DeviceConfig) -> ClientConfig {
    ClientConfig {
        host: cfg.host.clone(),
        port: cfg.port,
        timeout_ms: cfg.timeout_ms,
        retry_count: cfg.max_retries as usize,
        retry_backoff_ms: cfg.retry_delay_ms,
        keepalive: cfg.keepalive,
        nagle: cfg.nagle,
        socket_recv_buffer: cfg.socket_recv_buffer,
        socket_send_buffer: cfg.socket_send_buffer,
        ..ClientConfig::default()
    }
}

fn invalidated_channels(old: &DeviceConfig, new: &DeviceConfig) -> Vec<u8> {
    let mut invalidated = Vec::new();
    for new_channel in &new.channels {
        if let Some(old_channel) = old
            .channels
            .iter()
            .find(|c| c.channel_number == new_channel.channel_number)
        {
            let layout_changed = old_channel.start_register != new_channel.start_register
                || old_channel.register_count != new_channel.register_count
                || old_channel.scale != new_channel.scale
                || old_channel.offset != new_channel.offset;
            if layout_changed {
                invalidated.push(new_channel.channel_number);
            }
        }
    }
    invalidated
}
