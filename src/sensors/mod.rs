//! Desktop sensors -- which window has focus and how long the user has been
//! idle.

pub mod x11;

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

pub use self::x11::X11Sensors;

/// The focused window and its owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FocusInfo {
    pub process_id: u32,
    pub process_name: String,
    pub window_title: String,
}

impl FocusInfo {
    /// Identity used to detect focus changes: same process and same title.
    pub fn key(&self) -> String {
        format!("{}:{}", self.process_id, self.window_title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleInfo {
    pub is_idle: bool,
    /// Time since the last keyboard or pointer input.
    pub idle_for: Duration,
}

impl IdleInfo {
    pub fn active() -> Self {
        Self {
            is_idle: false,
            idle_for: Duration::ZERO,
        }
    }

    pub fn from_idle_time(idle_for: Duration, threshold: Duration) -> Self {
        Self {
            is_idle: idle_for >= threshold,
            idle_for,
        }
    }
}

/// Source of focus and idle readings.
///
/// Implementations degrade to "no focus" and "not idle" when the platform
/// cannot answer; errors are reserved for unexpected failures.
#[async_trait::async_trait]
pub trait ActivitySensors: Send + Sync {
    async fn current_focus(&self) -> Result<Option<FocusInfo>>;
    async fn idle_state(&self) -> Result<IdleInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_key_includes_pid_and_title() {
        let a = FocusInfo {
            process_id: 10,
            process_name: "firefox".into(),
            window_title: "Docs".into(),
        };
        let b = FocusInfo {
            window_title: "Mail".into(),
            ..a.clone()
        };
        assert_eq!(a.key(), "10:Docs");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_idle_threshold_is_inclusive() {
        let threshold = Duration::from_secs(300);
        assert!(IdleInfo::from_idle_time(Duration::from_secs(300), threshold).is_idle);
        assert!(!IdleInfo::from_idle_time(Duration::from_secs(299), threshold).is_idle);
        assert!(!IdleInfo::active().is_idle);
    }
}
