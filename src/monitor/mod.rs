//! Activity monitor loop -- samples the sensors, records activity events and
//! turns focus changes, idle resumes and the periodic schedule into capture
//! requests.

pub mod triggers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ConfigError, MonitorConfig};
use crate::scheduler::{Dispatcher, Request};
use crate::sensors::ActivitySensors;
use crate::storage::{ActivityEvent, ActivityStore};

pub use self::triggers::{TriggerPolicy, TriggerReason};

/// Pause after a failed sample before trying again.
const SAMPLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct ActivityMonitor {
    sensors: Arc<dyn ActivitySensors>,
    store: ActivityStore,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    schedule: cron::Schedule,
    trigger_on_focus_change: bool,
    trigger_on_idle_resume: bool,
    policy: TriggerPolicy,
    /// `None` once the schedule has no further fire times.
    next_periodic: Option<DateTime<Utc>>,
    last_focus: Option<String>,
    was_idle: bool,
}

impl ActivityMonitor {
    pub fn new(
        config: &MonitorConfig,
        sensors: Arc<dyn ActivitySensors>,
        store: ActivityStore,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            sensors,
            store,
            dispatcher,
            interval: Duration::from_secs(config.sampling.interval_secs.max(1)),
            schedule: config.sampling.schedule()?,
            trigger_on_focus_change: config.capture.trigger_on_focus_change,
            trigger_on_idle_resume: config.capture.trigger_on_idle_resume,
            policy: TriggerPolicy::new(Duration::from_secs(
                config.sampling.min_trigger_interval_secs,
            )),
            // First periodic capture fires on the first sample.
            next_periodic: Some(Utc::now()),
            last_focus: None,
            was_idle: false,
        })
    }

    /// Sample until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "activity monitor started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sample(Utc::now(), Instant::now()).await {
                error!(error = %e, "error in activity monitoring loop");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SAMPLE_ERROR_BACKOFF) => {}
                }
            }
        }

        info!("activity monitor stopped");
    }

    async fn sample(&mut self, now: DateTime<Utc>, at: Instant) -> Result<()> {
        if self.periodic_due(now) {
            self.trigger(TriggerReason::Periodic, at);
        }

        let idle = self.sensors.idle_state().await?;
        if idle.is_idle {
            if !self.was_idle {
                info!(idle_secs = idle.idle_for.as_secs(), "user went idle");
            }
            self.was_idle = true;

            let event = ActivityEvent {
                is_idle: true,
                idle_duration_secs: Some(idle.idle_for.as_secs()),
                ..ActivityEvent::new("idle")
            };
            self.store.save_event(&event).await?;
            return Ok(());
        }

        if self.was_idle {
            self.was_idle = false;
            info!("user resumed from idle");
            if self.trigger_on_idle_resume {
                self.trigger(TriggerReason::IdleResume, at);
            }
        }

        let Some(focus) = self.sensors.current_focus().await? else {
            return Ok(());
        };
        let key = focus.key();
        if self.last_focus.as_deref() == Some(key.as_str()) {
            return Ok(());
        }

        info!(process = %focus.process_name, title = %focus.window_title, "focus changed");
        let event = ActivityEvent {
            process_id: Some(focus.process_id),
            process_name: Some(focus.process_name),
            window_title: Some(focus.window_title),
            ..ActivityEvent::new("focus_change")
        };
        self.store.save_event(&event).await?;
        self.last_focus = Some(key);

        if self.trigger_on_focus_change {
            self.trigger(TriggerReason::FocusChange, at);
        }
        Ok(())
    }

    fn periodic_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_periodic {
            Some(next) if now >= next => {
                self.next_periodic = self.schedule.after(&now).next();
                true
            }
            _ => false,
        }
    }

    fn trigger(&mut self, reason: TriggerReason, at: Instant) {
        if !self.policy.admit(reason, at) {
            debug!(%reason, "skipping capture, too soon since last trigger");
            return;
        }
        info!(%reason, "triggering screen capture");
        // Rejection is logged by the dispatcher.
        self.dispatcher
            .enqueue(Request::new(reason.as_str(), reason.priority()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::scheduler::testing::{FakeCapture, FakeInference, FakeSink};
    use crate::scheduler::Priority;
    use crate::sensors::{FocusInfo, IdleInfo};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSensors {
        idle: Mutex<VecDeque<IdleInfo>>,
        focus: Mutex<VecDeque<Option<FocusInfo>>>,
    }

    impl ScriptedSensors {
        fn push(&self, idle: IdleInfo, focus: Option<FocusInfo>) {
            self.idle.lock().unwrap().push_back(idle);
            self.focus.lock().unwrap().push_back(focus);
        }
    }

    #[async_trait::async_trait]
    impl ActivitySensors for ScriptedSensors {
        async fn current_focus(&self) -> Result<Option<FocusInfo>> {
            Ok(self.focus.lock().unwrap().pop_front().flatten())
        }

        async fn idle_state(&self) -> Result<IdleInfo> {
            let next = self.idle.lock().unwrap().pop_front();
            // Idle readings always have a paired focus slot; skip it when idle.
            if matches!(next, Some(i) if i.is_idle) {
                self.focus.lock().unwrap().pop_front();
            }
            Ok(next.unwrap_or_else(IdleInfo::active))
        }
    }

    fn window(pid: u32, title: &str) -> Option<FocusInfo> {
        Some(FocusInfo {
            process_id: pid,
            process_name: format!("proc{pid}"),
            window_title: title.to_string(),
        })
    }

    fn idle(secs: u64) -> IdleInfo {
        IdleInfo {
            is_idle: true,
            idle_for: Duration::from_secs(secs),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ActivityStore,
        sensors: Arc<ScriptedSensors>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ActivityStore::open(&dir.path().join("activity.db")).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            &QueueConfig::default(),
            Arc::new(FakeCapture::frames(1)),
            Arc::new(FakeInference::ok()),
            Arc::new(FakeSink::default()),
        ));
        Fixture {
            _dir: dir,
            store,
            sensors: Arc::new(ScriptedSensors::default()),
            dispatcher,
        }
    }

    fn monitor(f: &Fixture, config: &MonitorConfig) -> ActivityMonitor {
        ActivityMonitor::new(config, f.sensors.clone(), f.store.clone(), f.dispatcher.clone()).unwrap()
    }

    fn queued(f: &Fixture, priority: Priority) -> usize {
        f.dispatcher.queue_depths()[priority.index()].1
    }

    #[tokio::test]
    async fn test_focus_changes_recorded_and_throttled() {
        let f = fixture();
        let mut m = monitor(&f, &MonitorConfig::default());
        let now = Utc::now();
        let t0 = Instant::now();

        f.sensors.push(IdleInfo::active(), window(1, "editor"));
        f.sensors.push(IdleInfo::active(), window(1, "editor"));
        f.sensors.push(IdleInfo::active(), window(2, "browser"));

        m.sample(now, t0).await.unwrap();
        // Periodic capture on the first sample, plus the first focus change.
        assert_eq!(queued(&f, Priority::Normal), 1);
        assert_eq!(queued(&f, Priority::High), 1);

        // Same window: nothing new.
        m.sample(now, t0 + Duration::from_secs(5)).await.unwrap();
        assert_eq!(queued(&f, Priority::High), 1);

        // New window inside the throttle: event recorded, no capture.
        m.sample(now, t0 + Duration::from_secs(6)).await.unwrap();
        assert_eq!(queued(&f, Priority::High), 1);
        assert_eq!(queued(&f, Priority::Normal), 1);

        let events = f.store.query_events(None, None, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == "focus_change"));
        assert!(events.iter().any(|e| e.window_title.as_deref() == Some("browser")));
    }

    #[tokio::test]
    async fn test_idle_resume_triggers_capture() {
        let f = fixture();
        let mut m = monitor(&f, &MonitorConfig::default());
        let now = Utc::now();
        let t0 = Instant::now();

        f.sensors.push(idle(400), None);
        f.sensors.push(idle(405), None);
        f.sensors.push(IdleInfo::active(), window(1, "editor"));

        m.sample(now, t0).await.unwrap();
        m.sample(now, t0 + Duration::from_secs(5)).await.unwrap();
        assert_eq!(queued(&f, Priority::High), 0);

        m.sample(now, t0 + Duration::from_secs(10)).await.unwrap();
        // Idle resume fired; the focus change right after is throttled.
        assert_eq!(queued(&f, Priority::High), 1);

        let events = f.store.query_events(None, None, 10).await.unwrap();
        let idle_events: Vec<_> = events.iter().filter(|e| e.event_type == "idle").collect();
        assert_eq!(idle_events.len(), 2);
        assert!(idle_events.iter().all(|e| e.is_idle));
        assert!(idle_events.iter().any(|e| e.idle_duration_secs == Some(405)));
        assert_eq!(events.iter().filter(|e| e.event_type == "focus_change").count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_flags_disable_event_captures() {
        let f = fixture();
        let mut config = MonitorConfig::default();
        config.capture.trigger_on_focus_change = false;
        config.capture.trigger_on_idle_resume = false;
        let mut m = monitor(&f, &config);
        let now = Utc::now();
        let t0 = Instant::now();

        f.sensors.push(idle(600), None);
        f.sensors.push(IdleInfo::active(), window(3, "terminal"));
        m.sample(now, t0).await.unwrap();
        m.sample(now, t0 + Duration::from_secs(60)).await.unwrap();

        assert_eq!(queued(&f, Priority::High), 0);
        assert_eq!(queued(&f, Priority::Normal), 1);
        assert_eq!(f.store.query_events(None, None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_periodic_follows_schedule() {
        let f = fixture();
        let mut m = monitor(&f, &MonitorConfig::default());
        let now = Utc::now();
        let t0 = Instant::now();

        m.sample(now, t0).await.unwrap();
        m.sample(now, t0).await.unwrap();
        assert_eq!(queued(&f, Priority::Normal), 1);

        // Four minutes later at least one three-minute boundary has passed.
        m.sample(now + chrono::Duration::minutes(4), t0).await.unwrap();
        assert_eq!(queued(&f, Priority::Normal), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let m = monitor(&f, &MonitorConfig::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(m.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        // The first tick is immediate and fires the periodic capture.
        assert_eq!(queued(&f, Priority::Normal), 1);
    }
}
