//! Terminal classification of a processed request.

use std::fmt;

use serde::Serialize;

/// How a request's processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Inference succeeded and the result was persisted.
    Completed,
    /// Inference succeeded but persistence failed. Still counts as completed.
    CompletedUnpersisted,
    /// Capture produced no frames; inference was never called.
    CaptureFailed,
    /// Inference returned no result.
    InferenceFailed,
    /// Shutdown or external cancellation interrupted processing.
    Cancelled,
    /// The request body panicked.
    Faulted,
}

impl Outcome {
    /// Whether this outcome increments the `completed` counter.
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Completed | Outcome::CompletedUnpersisted)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Completed => "completed",
            Outcome::CompletedUnpersisted => "completed_unpersisted",
            Outcome::CaptureFailed => "capture_failed",
            Outcome::InferenceFailed => "inference_failed",
            Outcome::Cancelled => "cancelled",
            Outcome::Faulted => "faulted",
        };
        f.write_str(s)
    }
}
