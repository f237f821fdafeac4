//! Why a capture is requested, and the throttle applied to event triggers.

use std::fmt;
use std::time::{Duration, Instant};

use crate::scheduler::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Cron-scheduled monitoring capture.
    Periodic,
    /// The user came back after being idle.
    IdleResume,
    /// A different window took focus.
    FocusChange,
    /// Requested through the HTTP API.
    Manual,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::Periodic => "periodic_monitoring",
            TriggerReason::IdleResume => "idle_resume",
            TriggerReason::FocusChange => "focus_change",
            TriggerReason::Manual => "manual",
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            TriggerReason::Periodic | TriggerReason::Manual => Priority::Normal,
            TriggerReason::IdleResume | TriggerReason::FocusChange => Priority::High,
        }
    }

    /// Event triggers share the throttle; the others bypass it.
    pub fn is_event(self) -> bool {
        matches!(self, TriggerReason::IdleResume | TriggerReason::FocusChange)
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit for event-driven captures.
#[derive(Debug)]
pub struct TriggerPolicy {
    min_interval: Duration,
    last_event: Option<Instant>,
}

impl TriggerPolicy {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_event: None,
        }
    }

    /// Whether `reason` may fire at `now`. An admitted event trigger resets
    /// the throttle clock; non-event triggers never touch it.
    pub fn admit(&mut self, reason: TriggerReason, now: Instant) -> bool {
        if !reason.is_event() {
            return true;
        }
        if let Some(last) = self.last_event {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_event = Some(now);
        true
    }
}
