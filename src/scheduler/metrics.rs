//! Running counters and a rolling latency window for the dispatch layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::history::Outcome;

/// Number of recent completion durations kept for the average.
pub const LATENCY_SAMPLES: usize = 100;

/// Point-in-time view of the dispatch layer.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    /// Completed requests whose result could not be stored.
    pub persist_failed: u64,
    #[serde(rename = "avg_processing_ms", serialize_with = "serialize_millis")]
    pub avg_processing_time: Duration,
    pub last_updated: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Monotonic counters updated by workers, read by anyone.
///
/// Never reset; lives as long as the process.
pub struct MetricsCollector {
    completed: AtomicU64,
    failed: AtomicU64,
    persist_failed: AtomicU64,
    samples: Mutex<VecDeque<Duration>>,
    max_samples: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_window(LATENCY_SAMPLES)
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(max_samples: usize) -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            persist_failed: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples: max_samples.max(1),
        }
    }

    /// Account for one request reaching a terminal state.
    ///
    /// `elapsed` only feeds the latency window for successful outcomes.
    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        match outcome {
            Outcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.record_latency(elapsed);
            }
            Outcome::CompletedUnpersisted => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.persist_failed.fetch_add(1, Ordering::Relaxed);
                self.record_latency(elapsed);
            }
            Outcome::CaptureFailed
            | Outcome::InferenceFailed
            | Outcome::Cancelled
            | Outcome::Faulted => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn persist_failed(&self) -> u64 {
        self.persist_failed.load(Ordering::Relaxed)
    }

    /// Mean of the retained samples, zero when there are none.
    pub fn average_processing_time(&self) -> Duration {
        let samples = self.lock_samples();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = samples.iter().sum();
        total / samples.len() as u32
    }

    pub fn sample_count(&self) -> usize {
        self.lock_samples().len()
    }

    /// Build a snapshot. Queue depth and in-flight count come from their
    /// owners; the fields are individually, not jointly, consistent.
    pub fn snapshot(&self, queued: usize, in_flight: usize) -> QueueMetrics {
        QueueMetrics {
            queued,
            in_flight,
            completed: self.completed(),
            failed: self.failed(),
            persist_failed: self.persist_failed(),
            avg_processing_time: self.average_processing_time(),
            last_updated: Utc::now(),
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut samples = self.lock_samples();
        samples.push_back(elapsed);
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    fn lock_samples(&self) -> std::sync::MutexGuard<'_, VecDeque<Duration>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }
}
