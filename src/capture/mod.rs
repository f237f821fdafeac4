//! Screen capture -- short low-FPS clips of encoded frames.

pub mod command;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use self::command::CommandCapture;

/// Anything that can grab a clip of the screen.
///
/// `None` (or an empty list) means there is no usable capture; callers never
/// look inside the buffers.
#[async_trait::async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture_frames(&self, cancel: &CancellationToken) -> Option<Vec<Bytes>>;
}
