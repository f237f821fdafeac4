//! Per-request worker body: capture, then inference, then persistence.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::Outcome;
use super::metrics::MetricsCollector;
use super::queue::Request;
use crate::capture::CaptureProvider;
use crate::inference::InferenceProvider;
use crate::storage::PersistenceSink;

pub struct RequestProcessor {
    capture: Arc<dyn CaptureProvider>,
    inference: Arc<dyn InferenceProvider>,
    sink: Arc<dyn PersistenceSink>,
    metrics: Arc<MetricsCollector>,
}

impl RequestProcessor {
    pub fn new(
        capture: Arc<dyn CaptureProvider>,
        inference: Arc<dyn InferenceProvider>,
        sink: Arc<dyn PersistenceSink>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            capture,
            inference,
            sink,
            metrics,
        }
    }

    /// Run one request to a terminal outcome and account for it.
    ///
    /// Never retries. Every outcome, cancellation included, is recorded in
    /// the metrics before returning. Cancellation is honoured during capture
    /// and inference only; once a result exists it is always handed to the
    /// sink.
    pub async fn process(&self, mut request: Request, cancel: &CancellationToken) -> Outcome {
        let started = Instant::now();
        let outcome = self.run(&mut request, cancel).await;
        let elapsed = started.elapsed();
        self.metrics.record(outcome, elapsed);

        if outcome.is_success() {
            info!(
                request_id = %request.id,
                trigger = %request.trigger_reason,
                %outcome,
                elapsed_ms = elapsed.as_millis() as u64,
                "request completed"
            );
        } else {
            warn!(
                request_id = %request.id,
                trigger = %request.trigger_reason,
                %outcome,
                "request failed"
            );
        }
        outcome
    }

    async fn run(&self, request: &mut Request, cancel: &CancellationToken) -> Outcome {
        debug!(request_id = %request.id, priority = %request.priority, "capturing");
        let frames = match until_cancelled(cancel, self.capture.capture_frames(cancel)).await {
            None => return Outcome::Cancelled,
            Some(Some(frames)) if !frames.is_empty() => frames,
            Some(_) if cancel.is_cancelled() => return Outcome::Cancelled,
            Some(_) => return Outcome::CaptureFailed,
        };
        let frames = request.payload.insert(frames);

        debug!(request_id = %request.id, frames = frames.len(), "analyzing");
        let mut result = match until_cancelled(cancel, self.inference.analyze(frames.as_slice(), cancel)).await {
            None => return Outcome::Cancelled,
            Some(Some(result)) => result,
            Some(None) if cancel.is_cancelled() => return Outcome::Cancelled,
            Some(None) => return Outcome::InferenceFailed,
        };
        result.request_id = request.id;

        // Not raced against `cancel`: a started write runs to completion so the
        // recorded outcome matches what the sink holds.
        match self.sink.save(&result, cancel).await {
            Ok(()) => Outcome::Completed,
            Err(e) => {
                error!(request_id = %request.id, error = %e, "failed to persist result");
                Outcome::CompletedUnpersisted
            }
        }
    }
}

/// Drive `fut` unless `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
