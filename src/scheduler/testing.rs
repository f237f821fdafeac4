//! Scripted collaborators for driving the dispatch layer in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::CaptureProvider;
use crate::inference::{ActivityResult, InferenceProvider};
use crate::storage::PersistenceSink;

pub fn sample_result() -> ActivityResult {
    ActivityResult {
        request_id: Uuid::nil(),
        processed_at: Utc::now(),
        activity_label: "Coding".into(),
        application: "editor".into(),
        content_type: "code".into(),
        topic: "scheduling".into(),
        action: "coding".into(),
        summary: "Editing a dispatcher".into(),
        visible_text: "fn dispatch_next".into(),
        confidence: 0.9,
        detected_objects: Vec::new(),
        raw_response: None,
    }
}

/// Sleep for `delay`, returning `false` if cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub struct FakeCapture {
    frames: Option<Vec<Bytes>>,
    delay: Duration,
    panic_on_first: bool,
    pub calls: AtomicUsize,
    pub started: Mutex<Vec<Instant>>,
}

impl FakeCapture {
    pub fn frames(n: usize) -> Self {
        Self {
            frames: Some((0..n).map(|i| Bytes::from(format!("frame-{i}"))).collect()),
            delay: Duration::ZERO,
            panic_on_first: false,
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn none() -> Self {
        Self {
            frames: None,
            ..Self::frames(0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panic_on_first(mut self) -> Self {
        self.panic_on_first = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CaptureProvider for FakeCapture {
    async fn capture_frames(&self, cancel: &CancellationToken) -> Option<Vec<Bytes>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(Instant::now());
        if self.panic_on_first && call == 0 {
            panic!("capture backend crashed");
        }
        if !pause(self.delay, cancel).await {
            return None;
        }
        self.frames.clone()
    }
}

pub struct FakeInference {
    result: Option<ActivityResult>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeInference {
    pub fn ok() -> Self {
        Self {
            result: Some(sample_result()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn none() -> Self {
        Self {
            result: None,
            ..Self::ok()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl InferenceProvider for FakeInference {
    async fn analyze(&self, frames: &[Bytes], cancel: &CancellationToken) -> Option<ActivityResult> {
        assert!(!frames.is_empty(), "inference called without frames");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !pause(self.delay, cancel).await {
            return None;
        }
        self.result.clone()
    }
}

#[derive(Default)]
pub struct FakeSink {
    fail: bool,
    delay: Duration,
    pub saved: Mutex<Vec<ActivityResult>>,
    pub finished: Mutex<Vec<Instant>>,
}

impl FakeSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Delay every save. The delay ignores cancellation, like a blocking
    /// database write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn saved_ids(&self) -> Vec<Uuid> {
        self.saved.lock().unwrap().iter().map(|r| r.request_id).collect()
    }
}

#[async_trait::async_trait]
impl PersistenceSink for FakeSink {
    async fn save(&self, result: &ActivityResult, _cancel: &CancellationToken) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.lock().unwrap().push(Instant::now());
        if self.fail {
            anyhow::bail!("disk full");
        }
        self.saved.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
