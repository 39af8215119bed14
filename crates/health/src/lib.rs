#![allow(dead_code)]

//! `HealthTracker`: per-device read counters, status transitions, and
//! EWMA latency smoothing (spec.md §4.3).

use std::time::{Duration, Instant};

use chrono::Utc;
use types::{Health, HealthStatus};

const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// The result of one acquisition or connectivity-probe attempt, fed into
/// `HealthTracker::record`.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success { latency: Duration },
    Failure {
        error_message: String,
        /// Set when the failure is a transport-level "not connected"
        /// fault rather than a protocol/timeout failure on an otherwise
        /// live connection.
        disconnected: bool,
    },
}

/// Tracks one device's health state across its lifetime in the registry.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    device_id: String,
    max_consecutive_failures: u32,
    status: HealthStatus,
    is_connected: bool,
    total_reads: u64,
    successful_reads: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    avg_latency_ms: Option<f64>,
    last_success_at: Option<Instant>,
}

impl HealthTracker {
    /// A freshly registered device: `status = Unknown` until the first
    /// outcome (spec.md §4.3).
    pub fn new(device_id: impl Into<String>, max_consecutive_failures: u32) -> Self {
        Self {
            device_id: device_id.into(),
            max_consecutive_failures,
            status: HealthStatus::Unknown,
            is_connected: false,
            total_reads: 0,
            successful_reads: 0,
            consecutive_failures: 0,
            last_error: None,
            avg_latency_ms: None,
            last_success_at: None,
        }
    }

    /// Builds the tracker that replaces this one across an `UpdateDevice`
    /// call: `total_reads`, `successful_reads`, and the `last_success_at`
    /// baseline survive; `consecutive_failures` and `last_error` are
    /// cleared, and status reverts to `Unknown` until the next outcome,
    /// matching the registration rule (spec.md §4.5).
    pub fn carry_forward(&self, max_consecutive_failures: u32) -> Self {
        Self {
            device_id: self.device_id.clone(),
            max_consecutive_failures,
            status: HealthStatus::Unknown,
            is_connected: self.is_connected,
            total_reads: self.total_reads,
            successful_reads: self.successful_reads,
            consecutive_failures: 0,
            last_error: None,
            avg_latency_ms: self.avg_latency_ms,
            last_success_at: self.last_success_at,
        }
    }

    /// Applies the update rule of spec.md §4.3 for one outcome and
    /// returns the new `Health` record to publish.
    pub fn record(&mut self, outcome: &Outcome) -> Health {
        self.total_reads += 1;

        match outcome {
            Outcome::Success { latency } => {
                self.successful_reads += 1;
                self.consecutive_failures = 0;
                self.is_connected = true;
                self.last_success_at = Some(Instant::now());
                self.avg_latency_ms = Some(ewma(self.avg_latency_ms, latency.as_secs_f64() * 1000.0));
                self.status = HealthStatus::Online;
            }
            Outcome::Failure {
                error_message,
                disconnected,
            } => {
                self.consecutive_failures += 1;
                self.last_error = Some(error_message.clone());
                self.is_connected = false;
                self.status = if *disconnected {
                    HealthStatus::Offline
                } else if self.consecutive_failures >= self.max_consecutive_failures {
                    HealthStatus::Error
                } else {
                    HealthStatus::Warning
                };
            }
        }

        self.snapshot()
    }

    /// A terminal record for a removed device (spec.md §4.5 `RemoveDevice`).
    pub fn terminal(&self) -> Health {
        Health {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            status: HealthStatus::Offline,
            is_connected: false,
            last_successful_read_age: self.last_successful_read_age(),
            consecutive_failures: self.consecutive_failures,
            avg_latency_ms: self.avg_latency_ms,
            last_error: self.last_error.clone(),
            total_reads: self.total_reads,
            successful_reads: self.successful_reads,
        }
    }

    /// Current state without recording a new outcome, e.g. for
    /// `AddDevice`'s initial publish.
    pub fn snapshot(&self) -> Health {
        Health {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            status: self.status,
            is_connected: self.is_connected,
            last_successful_read_age: self.last_successful_read_age(),
            consecutive_failures: self.consecutive_failures,
            avg_latency_ms: self.avg_latency_ms,
            last_error: self.last_error.clone(),
            total_reads: self.total_reads,
            successful_reads: self.successful_reads,
        }
    }

    fn last_successful_read_age(&self) -> Option<Duration> {
        self.last_success_at.map(|at| at.elapsed())
    }
}

fn ewma(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(previous) => LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * previous,
        None => sample,
    }
}
