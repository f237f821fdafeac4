//! Capture frames by running an external screenshot tool.
//!
//! The tool must write a single encoded image (JPEG/PNG) to stdout, e.g.
//! ImageMagick `import -window root jpeg:-` on X11 or `grim -t jpeg -` on
//! Wayland.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CaptureProvider;
use crate::config::CaptureConfig;

pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    frame_interval: Duration,
    max_frames: u32,
    /// Only one clip is recorded at a time.
    in_progress: Mutex<()>,
}

impl CommandCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        let frame_rate = config.frame_rate.max(1);
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            frame_interval: Duration::from_secs_f64(1.0 / f64::from(frame_rate)),
            max_frames: max_frames(config),
            in_progress: Mutex::new(()),
        }
    }

    pub fn max_frames(&self) -> u32 {
        self.max_frames
    }

    async fn grab_frame(&self) -> Result<Bytes> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to execute '{}'", self.program))?;

        if !output.status.success() {
            bail!(
                "'{}' exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if output.stdout.is_empty() {
            bail!("'{}' produced no image data", self.program);
        }
        Ok(Bytes::from(output.stdout))
    }
}

/// Frames per clip: bounded by both the frame cap and the clip duration.
fn max_frames(config: &CaptureConfig) -> u32 {
    config
        .max_frames_per_capture
        .min(config.max_duration_secs.saturating_mul(config.frame_rate))
}

#[async_trait::async_trait]
impl CaptureProvider for CommandCapture {
    async fn capture_frames(&self, cancel: &CancellationToken) -> Option<Vec<Bytes>> {
        let Ok(_guard) = self.in_progress.try_lock() else {
            warn!("capture already in progress, skipping");
            return None;
        };

        info!(
            max_frames = self.max_frames,
            interval_ms = self.frame_interval.as_millis() as u64,
            "starting capture"
        );

        let mut frames = Vec::with_capacity(self.max_frames as usize);
        for i in 0..self.max_frames {
            if cancel.is_cancelled() {
                break;
            }

            // Dropping the grab future kills the child (kill_on_drop).
            let grabbed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.grab_frame() => r,
            };
            match grabbed {
                Ok(frame) => {
                    debug!(frame = i + 1, bytes = frame.len(), "captured frame");
                    frames.push(frame);
                }
                Err(e) => error!(frame = i + 1, error = %e, "frame capture failed"),
            }

            if i + 1 < self.max_frames {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.frame_interval) => {}
                }
            }
        }

        info!(frames = frames.len(), "capture completed");
        if frames.is_empty() {
            None
        } else {
            Some(frames)
        }
    }
}
