//! Vision-language inference -- structured activity results from screen frames.

pub mod ollama;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use self::ollama::OllamaClient;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("inference backend returned an empty response")]
    EmptyResponse,

    #[error("no frames to analyze")]
    NoFrames,

    #[error("inference cancelled")]
    Cancelled,
}

/// An object the model reported seeing on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Structured description of what the user was doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    /// Originating request; stamped by the request processor.
    pub request_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub activity_label: String,
    pub application: String,
    pub content_type: String,
    pub topic: String,
    pub action: String,
    pub summary: String,
    pub visible_text: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub detected_objects: Vec<DetectedObject>,
    #[serde(default)]
    pub raw_response: Option<String>,
}

impl ActivityResult {
    /// Clamp confidence into `[0, 1]`; NaN becomes 0.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self
    }
}

/// Anything that can turn captured frames into an [`ActivityResult`].
///
/// `None` means the analysis failed; implementations log the reason.
#[async_trait::async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn analyze(&self, frames: &[Bytes], cancel: &CancellationToken) -> Option<ActivityResult>;
}
