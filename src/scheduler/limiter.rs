//! Counting permit pool bounding how many requests process at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::SchedulerError;

/// A fixed pool of `capacity` permits.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of allowed concurrency. Returned to the pool on drop, whatever
/// path the holder exits by.
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free permit or cancellation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, SchedulerError> {
        // The semaphore is never closed, so acquisition only fails by
        // cancellation.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map(|p| Permit { _inner: p })
                .map_err(|_| SchedulerError::Cancelled),
        }
    }
}
