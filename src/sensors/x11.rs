//! X11 sensors backed by `xdotool`, `xprintidle` and `/proc`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;
use tracing::debug;

use super::{ActivitySensors, FocusInfo, IdleInfo};

pub struct X11Sensors {
    idle_threshold: Duration,
}

impl X11Sensors {
    pub fn new(idle_threshold: Duration) -> Self {
        Self { idle_threshold }
    }
}

/// Run a tool and return its trimmed stdout, or `None` if it is missing or
/// fails.
async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!(program, error = %e, "sensor tool unavailable");
            return None;
        }
    };
    if !output.status.success() {
        debug!(program, status = ?output.status.code(), "sensor tool failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn process_name(pid: u32) -> String {
    match tokio::fs::read_to_string(format!("/proc/{pid}/comm")).await {
        Ok(name) => name.trim().to_string(),
        Err(_) => "unknown".to_string(),
    }
}

/// `xprintidle` prints milliseconds since the last input.
fn parse_idle_millis(text: &str) -> Option<Duration> {
    text.trim().parse::<u64>().ok().map(Duration::from_millis)
}

#[async_trait::async_trait]
impl ActivitySensors for X11Sensors {
    async fn current_focus(&self) -> Result<Option<FocusInfo>> {
        let Some(pid) = run_tool("xdotool", &["getactivewindow", "getwindowpid"]).await else {
            return Ok(None);
        };
        let Ok(process_id) = pid.parse::<u32>() else {
            debug!(output = %pid, "unexpected xdotool pid output");
            return Ok(None);
        };
        let window_title = run_tool("xdotool", &["getactivewindow", "getwindowname"])
            .await
            .unwrap_or_default();

        Ok(Some(FocusInfo {
            process_id,
            process_name: process_name(process_id).await,
            window_title,
        }))
    }

    async fn idle_state(&self) -> Result<IdleInfo> {
        let idle_for = run_tool("xprintidle", &[])
            .await
            .as_deref()
            .and_then(parse_idle_millis);
        Ok(match idle_for {
            Some(idle_for) => IdleInfo::from_idle_time(idle_for, self.idle_threshold),
            None => IdleInfo::active(),
        })
    }
}
