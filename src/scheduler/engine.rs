//! The dispatcher: one control loop draining the priority queue into
//! permit-bounded worker tasks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::Outcome;
use super::limiter::ConcurrencyLimiter;
use super::metrics::{MetricsCollector, QueueMetrics};
use super::processor::RequestProcessor;
use super::queue::{Priority, PriorityQueue, Request};
use super::tracker::{InFlight, RequestTracker};
use super::SchedulerError;
use crate::capture::CaptureProvider;
use crate::config::QueueConfig;
use crate::inference::InferenceProvider;
use crate::storage::PersistenceSink;

/// Delay before the loop retries after a fault in its own body.
pub const LOOP_FAULT_BACKOFF: Duration = Duration::from_secs(1);

struct Shared {
    queue: PriorityQueue<Request>,
    limiter: ConcurrencyLimiter,
    tracker: RequestTracker,
    metrics: Arc<MetricsCollector>,
    processor: RequestProcessor,
}

enum State {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Admission, dispatch and shutdown drain for capture requests.
///
/// Lifecycle is `Idle -> Running -> Stopped`; a stopped dispatcher cannot be
/// restarted.
pub struct Dispatcher {
    shared: Arc<Shared>,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(
        config: &QueueConfig,
        capture: Arc<dyn CaptureProvider>,
        inference: Arc<dyn InferenceProvider>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let processor = RequestProcessor::new(capture, inference, sink, metrics.clone());
        Self {
            shared: Arc::new(Shared {
                queue: PriorityQueue::new(config.max_queue_size),
                limiter: ConcurrencyLimiter::new(config.max_concurrent_workers),
                tracker: RequestTracker::new(),
                metrics,
                processor,
            }),
            state: Mutex::new(State::Idle),
        }
    }

    /// Spawn the dispatch loop. It stops when `parent` is cancelled or on
    /// [`stop`](Self::stop).
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        match *state {
            State::Idle => {}
            State::Running { .. } => return Err(SchedulerError::AlreadyStarted),
            State::Stopped => return Err(SchedulerError::Stopped),
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(run_loop(self.shared.clone(), cancel.clone()));
        *state = State::Running { cancel, handle };

        info!(
            workers = self.shared.limiter.capacity(),
            queue_capacity = self.shared.queue.capacity(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Stop dispatching, discard undispatched requests and wait for every
    /// in-flight request to finish.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let State::Running { cancel, handle } = std::mem::replace(&mut *state, State::Stopped) {
            info!("stopping dispatcher");
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch loop terminated abnormally");
            }
        }

        let discarded = self.shared.queue.clear();
        if discarded > 0 {
            warn!(discarded, "discarded queued requests that were never dispatched");
        }

        let in_flight = self.shared.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight requests to drain");
        }
        self.shared.tracker.drained().await;

        info!(
            completed = self.shared.metrics.completed(),
            failed = self.shared.metrics.failed(),
            persist_failed = self.shared.metrics.persist_failed(),
            "dispatcher stopped"
        );
    }

    /// Offer a request for processing. Never blocks; `false` means the queue
    /// was full and the request was dropped.
    pub fn enqueue(&self, request: Request) -> bool {
        let priority = request.priority;
        match self.shared.queue.try_add(request, priority) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(
                    request_id = %rejected.id,
                    trigger = %rejected.trigger_reason,
                    %priority,
                    capacity = self.shared.queue.capacity(),
                    "queue full, request rejected"
                );
                false
            }
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.shared
            .metrics
            .snapshot(self.shared.queue.len(), self.shared.tracker.len())
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        self.shared.tracker.snapshot()
    }

    /// Queued requests per priority, lowest first.
    pub fn queue_depths(&self) -> [(Priority, usize); Priority::COUNT] {
        let depths = self.shared.queue.depths();
        Priority::ALL.map(|p| (p, depths[p.index()]))
    }

    pub fn available_permits(&self) -> usize {
        self.shared.limiter.available()
    }
}

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    debug!("dispatch loop running");
    loop {
        match dispatch_next(&shared, &cancel).await {
            Ok(()) => {}
            Err(SchedulerError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "dispatch loop fault, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(LOOP_FAULT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("dispatch loop exited");
}

/// Take the next request, wait for a permit and hand both to a worker.
async fn dispatch_next(shared: &Arc<Shared>, cancel: &CancellationToken) -> Result<(), SchedulerError> {
    let request = shared.queue.take(cancel).await?;

    let permit = match shared.limiter.acquire(cancel).await {
        Ok(permit) => permit,
        Err(e) => {
            warn!(request_id = %request.id, error = %e, "request dropped before dispatch");
            return Err(e);
        }
    };
    let registration = shared.tracker.register(&request)?;

    debug!(
        request_id = %request.id,
        priority = %request.priority,
        trigger = %request.trigger_reason,
        "dispatching"
    );

    let shared = Arc::clone(shared);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        // Dropped in reverse: the permit goes back before the request leaves
        // the tracker, so a finished drain implies all permits are free.
        let _registration = registration;
        let _permit = permit;

        let request_id = request.id;
        let started = Instant::now();
        let body = shared.processor.process(request, &cancel);
        if AssertUnwindSafe(body).catch_unwind().await.is_err() {
            error!(%request_id, "request processing panicked");
            shared.metrics.record(Outcome::Faulted, started.elapsed());
        }
    });
    Ok(())
}
