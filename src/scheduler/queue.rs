//! Bounded multi-priority queue.
//!
//! One FIFO bucket per [`Priority`]; `take` always yields from the highest
//! non-empty bucket. Admission never blocks. Removal blocks until an item is
//! observed or the cancellation token fires.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::SchedulerError;

/// Request priority levels (higher ordinal dequeues first).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Number of priority levels (and queue buckets).
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// A unit of capture + analysis work.
///
/// Owned by the queue until dispatched, then by its worker until it reaches
/// a terminal [`Outcome`](super::history::Outcome).
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Why the request exists (`focus_change`, `idle_resume`, ...). Carried
    /// for observability only.
    pub trigger_reason: String,
    pub priority: Priority,
    /// Captured frames; `None` until capture succeeds.
    pub payload: Option<Vec<Bytes>>,
}

impl Request {
    pub fn new(trigger_reason: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            trigger_reason: trigger_reason.into(),
            priority,
            payload: None,
        }
    }
}

/// Bounded priority queue with FIFO order inside each bucket.
///
/// `count` is only modified while the bucket lock is held, so
/// `sum(bucket lengths) == count` at every point where the lock is free and
/// `count <= capacity` always. Reads of `len()` are lock-free and approximate.
pub struct PriorityQueue<T> {
    buckets: Mutex<[VecDeque<T>; Priority::COUNT]>,
    count: AtomicUsize,
    capacity: usize,
    available: Notify,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            count: AtomicUsize::new(0),
            capacity,
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate depth, for metrics only.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit `item` without blocking.
    ///
    /// Returns the item back when the queue is at capacity.
    pub fn try_add(&self, item: T, priority: Priority) -> Result<(), T> {
        {
            let mut buckets = self.lock();
            if self.count.load(Ordering::Acquire) >= self.capacity {
                return Err(item);
            }
            buckets[priority.index()].push_back(item);
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove the highest-priority item, waiting until one is available.
    ///
    /// A wake-up is only a hint: if another consumer took the item first the
    /// scan comes up empty and we wait again.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<T, SchedulerError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }

            // Register interest before scanning so a concurrent try_add
            // between the scan and the await cannot be missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take() {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Non-blocking variant of [`take`](Self::take).
    pub fn try_take(&self) -> Option<T> {
        let mut buckets = self.lock();
        for bucket in buckets.iter_mut().rev() {
            if let Some(item) = bucket.pop_front() {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return Some(item);
            }
        }
        None
    }

    /// Discard everything still queued. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut buckets = self.lock();
        let mut dropped = 0;
        for bucket in buckets.iter_mut() {
            dropped += bucket.len();
            bucket.clear();
        }
        self.count.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    /// Per-bucket depth, lowest priority first.
    pub fn depths(&self) -> [usize; Priority::COUNT] {
        let buckets = self.lock();
        std::array::from_fn(|i| buckets[i].len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [VecDeque<T>; Priority::COUNT]> {
        // A panic while holding this lock cannot leave the buckets and the
        // counter out of step (both are updated after the last fallible op),
        // so recover from poisoning.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_capacity_rejects_third_item() {
        let q = PriorityQueue::new(2);
        assert!(q.try_add("A", Priority::Normal).is_ok());
        assert!(q.try_add("B", Priority::Normal).is_ok());
        assert_eq!(q.try_add("C", Priority::Normal), Err("C"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_higher_priority_first_then_fifo() {
        let q = PriorityQueue::new(10);
        q.try_add("H1", Priority::High).unwrap();
        q.try_add("L1", Priority::Low).unwrap();
        q.try_add("H2", Priority::High).unwrap();

        assert_eq!(q.try_take(), Some("H1"));
        assert_eq!(q.try_take(), Some("H2"));
        assert_eq!(q.try_take(), Some("L1"));
        assert_eq!(q.try_take(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_within_bucket() {
        let q = PriorityQueue::new(10);
        for item in ["A", "B", "C"] {
            q.try_add(item, Priority::Normal).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| q.try_take()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_every_priority_pair_respects_order() {
        for hi in Priority::ALL {
            for lo in Priority::ALL.iter().copied().filter(|p| *p < hi) {
                let q = PriorityQueue::new(4);
                q.try_add(lo, lo).unwrap();
                q.try_add(hi, hi).unwrap();
                assert_eq!(q.try_take(), Some(hi), "{} should beat {}", hi, lo);
            }
        }
    }

    #[test]
    fn test_clear_resets_count() {
        let q = PriorityQueue::new(10);
        q.try_add(1, Priority::Low).unwrap();
        q.try_add(2, Priority::Critical).unwrap();
        q.try_add(3, Priority::Normal).unwrap();

        assert_eq!(q.clear(), 3);
        assert_eq!(q.len(), 0);
        assert_eq!(q.depths(), [0, 0, 0, 0]);
        // Capacity is available again after clearing.
        assert!(q.try_add(4, Priority::Low).is_ok());
    }

    #[test]
    fn test_take_blocks_until_item_added() {
        let q = PriorityQueue::new(4);
        let cancel = CancellationToken::new();

        let mut take = tokio_test::task::spawn(q.take(&cancel));
        assert_pending!(take.poll());

        q.try_add("late", Priority::Low).unwrap();
        assert!(take.is_woken());
        let item = assert_ready!(take.poll());
        assert_eq!(item.unwrap(), "late");
    }

    #[test]
    fn test_take_returns_cancelled() {
        let q: PriorityQueue<u32> = PriorityQueue::new(4);
        let cancel = CancellationToken::new();

        let mut take = tokio_test::task::spawn(q.take(&cancel));
        assert_pending!(take.poll());

        cancel.cancel();
        assert!(take.is_woken());
        let result = assert_ready!(take.poll());
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
    }

    #[test]
    fn test_lost_race_rewaits() {
        let q = PriorityQueue::new(4);
        let cancel = CancellationToken::new();

        let mut take = tokio_test::task::spawn(q.take(&cancel));
        assert_pending!(take.poll());

        // Item arrives and is stolen before the waiter gets to scan.
        q.try_add(7, Priority::High).unwrap();
        assert_eq!(q.try_take(), Some(7));

        assert!(take.is_woken());
        assert_pending!(take.poll());

        q.try_add(8, Priority::High).unwrap();
        let item = assert_ready!(take.poll());
        assert_eq!(item.unwrap(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_exceeds_capacity() {
        let capacity = 50;
        let q = Arc::new(PriorityQueue::new(capacity));

        let mut handles = Vec::new();
        for producer in 0..16 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0usize;
                for i in 0..100 {
                    let priority = Priority::ALL[(producer + i) % Priority::COUNT];
                    if q.try_add((producer, i), priority).is_ok() {
                        admitted += 1;
                    }
                    assert!(q.len() <= capacity);
                    tokio::task::yield_now().await;
                }
                admitted
            }));
        }

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }

        assert_eq!(total, capacity);
        assert_eq!(q.len(), capacity);
        assert_eq!(q.depths().iter().sum::<usize>(), capacity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_take_each_item_once() {
        let q = Arc::new(PriorityQueue::new(1000));
        let cancel = CancellationToken::new();

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let cancel = cancel.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(item) = q.take(&cancel).await {
                    seen.push(item);
                }
                seen
            }));
        }

        for i in 0..500u32 {
            q.try_add(i, Priority::ALL[(i as usize) % Priority::COUNT]).unwrap();
        }

        while !q.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
    }
}
