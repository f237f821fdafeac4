//! Request scheduling -- priority queue, bounded-concurrency dispatch and
//! per-request processing.

pub mod engine;
pub mod history;
pub mod limiter;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;
use uuid::Uuid;

pub use self::engine::Dispatcher;
pub use self::history::Outcome;
pub use self::metrics::{MetricsCollector, QueueMetrics};
pub use self::processor::RequestProcessor;
pub use self::queue::{Priority, PriorityQueue, Request};
pub use self::tracker::{InFlight, RequestTracker};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("request {0} is already in flight")]
    DuplicateRequest(Uuid),

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("dispatcher has been stopped")]
    Stopped,
}
