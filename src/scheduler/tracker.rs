//! Registry of in-flight requests, used to wait for drain at shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::queue::{Priority, Request};
use super::SchedulerError;

/// What we know about a request while it is being processed.
#[derive(Debug, Clone, Serialize)]
pub struct InFlight {
    pub request_id: Uuid,
    pub trigger_reason: String,
    pub priority: Priority,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerInner {
    entries: Mutex<HashMap<Uuid, InFlight>>,
    emptied: Notify,
}

/// Concurrent map of in-flight requests keyed by request id.
#[derive(Clone, Default)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

/// Keeps a request registered until dropped.
///
/// Held by the worker for the whole request body, so deregistration happens
/// on every exit path including unwinding.
#[must_use = "the request is deregistered as soon as the guard is dropped"]
pub struct Registration {
    tracker: RequestTracker,
    request_id: Uuid,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request` as in flight.
    pub fn register(&self, request: &Request) -> Result<Registration, SchedulerError> {
        let mut entries = self.lock();
        if entries.contains_key(&request.id) {
            return Err(SchedulerError::DuplicateRequest(request.id));
        }
        entries.insert(
            request.id,
            InFlight {
                request_id: request.id,
                trigger_reason: request.trigger_reason.clone(),
                priority: request.priority,
                dispatched_at: Utc::now(),
            },
        );
        Ok(Registration {
            tracker: self.clone(),
            request_id: request.id,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of in-flight requests, oldest dispatch first.
    pub fn snapshot(&self) -> Vec<InFlight> {
        let mut list: Vec<InFlight> = self.lock().values().cloned().collect();
        list.sort_by_key(|e| e.dispatched_at);
        list
    }

    /// Wait until no request is in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn deregister(&self, id: &Uuid) {
        let now_empty = {
            let mut entries = self.lock();
            entries.remove(id);
            entries.is_empty()
        };
        if now_empty {
            self.inner.emptied.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.deregister(&self.request_id);
    }
}
