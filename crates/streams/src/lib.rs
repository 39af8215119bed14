#![allow(dead_code)]

//! `StreamHub`: fan-out of readings and health records to independent
//! subscribers, each isolated from the others' backpressure (spec.md §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Notify};
use tracing::warn;
use types::{Health, Reading};

struct HealthSlot {
    /// Coalesced by device_id: a health update for a device that already
    /// has one pending replaces it rather than queuing (spec.md §4.6).
    pending: Mutex<HashMap<String, Health>>,
    notify: Notify,
}

impl HealthSlot {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, health: Health) {
        self.pending
            .lock()
            .expect("health slot mutex poisoned")
            .insert(health.device_id.clone(), health);
        self.notify.notify_one();
    }
}

struct Inner {
    readings_tx: broadcast::Sender<Reading>,
    health_slots: Mutex<HashMap<u64, Arc<HealthSlot>>>,
    next_subscriber_id: AtomicU64,
}

/// Hands readings and health updates to whichever consumers are
/// currently subscribed. Cheap to clone; all clones share one hub.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<Inner>,
}

impl StreamHub {
    pub fn new(readings_buffer_size: usize) -> Self {
        let (readings_tx, _) = broadcast::channel(readings_buffer_size.max(1));
        Self {
            inner: Arc::new(Inner {
                readings_tx,
                health_slots: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes a reading. Readings are loss-tolerant: a subscriber that
    /// falls behind the buffer size loses the oldest entries rather than
    /// blocking the publisher (spec.md §4.6).
    pub fn publish_reading(&self, reading: Reading) {
        // No receivers is not an error; it just means nobody is listening yet.
        let _ = self.inner.readings_tx.send(reading);
    }

    /// Publishes a health update. Delivery to each subscriber coalesces
    /// by `device_id`: an unread update for the same device is replaced,
    /// never queued (spec.md §4.6).
    pub fn publish_health(&self, health: Health) {
        let slots = self.inner.health_slots.lock().expect("health slots mutex poisoned");
        for slot in slots.values() {
            slot.push(health.clone());
        }
    }

    pub fn subscribe_readings(&self) -> ReadingSubscription {
        ReadingSubscription {
            receiver: self.inner.readings_tx.subscribe(),
        }
    }

    pub fn subscribe_health(&self) -> HealthSubscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(HealthSlot::new());
        self.inner
            .health_slots
            .lock()
            .expect("health slots mutex poisoned")
            .insert(id, slot.clone());
        HealthSubscription {
            id,
            hub: self.inner.clone(),
            slot,
        }
    }
}

/// A readings subscription. Drop-oldest overflow surfaces as a skipped
/// count, logged and then transparently absorbed — callers never see a
/// lag error, only the next reading that is still buffered.
pub struct ReadingSubscription {
    receiver: broadcast::Receiver<Reading>,
}

impl ReadingSubscription {
    pub async fn recv(&mut self) -> Option<Reading> {
        loop {
            match self.receiver.recv().await {
                Ok(reading) => return Some(reading),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "readings subscriber lagged, dropped oldest entries");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A health subscription. Unsubscribes itself from the hub on drop.
pub struct HealthSubscription {
    id: u64,
    hub: Arc<Inner>,
    slot: Arc<HealthSlot>,
}

impl HealthSubscription {
    pub async fn recv(&mut self) -> Option<Health> {
        loop {
            let next = {
                let mut pending = self.slot.pending.lock().expect("health slot mutex poisoned");
                let key = pending.keys().next().cloned();
                key.and_then(|k| pending.remove(&k))
            };
            if let Some(health) = next {
                return Some(health);
            }
            self.slot.notify.notified().await;
        }
    }
}

impl Drop for HealthSubscription {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.hub.health_slots.lock() {
            slots.remove(&self.id);
        }
    }
}
