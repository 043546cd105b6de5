use crate::models::config::{AudioConfig, VideoConfig};
use crate::models::error::StreamError;
use crate::models::state::SessionState;
use crate::models::stream_report::StreamReport;
use crate::processing::surface::Surface;

/// Command surface of a live streaming session.
///
/// Implemented by [`StreamSession`](crate::session::orchestrator::StreamSession).
/// Notifications flow back through the
/// [`SessionEvents`](crate::models::events::SessionEvents) channels handed out
/// at construction.
pub trait Streamer: Send + Sync {
    /// Current session state.
    fn state(&self) -> SessionState;

    /// Whether raw capture is running, independent of streaming.
    fn is_capturing(&self) -> bool;

    /// Apply configuration. Transitions: idle → configured.
    fn configure(&self, audio: Option<AudioConfig>, video: VideoConfig)
        -> Result<(), StreamError>;

    /// Start raw capture. Transitions: configured → capturing.
    fn start_capture(&self, preview: Option<Surface>, device_id: &str)
        -> Result<(), StreamError>;

    /// Move video capture to another camera, keeping the encoder surface.
    fn switch_camera(&self, device_id: &str) -> Result<(), StreamError>;

    /// Start encoding and muxing to the sink. Transitions: capturing → streaming.
    fn start_stream(&self) -> Result<(), StreamError>;

    /// Stop streaming. Transitions: streaming → stopping → configured.
    /// Returns `None` when no stream was running.
    fn stop_stream(&self) -> Result<Option<StreamReport>, StreamError>;

    /// Stop raw capture. Idempotent.
    fn stop_capture(&self) -> Result<(), StreamError>;

    /// Release every collaborator. Terminal and idempotent.
    fn release(&self);
}
