use crate::models::config::{AudioConfig, VideoConfig};
use crate::models::error::StreamError;
use crate::models::events::FailureReporter;
use crate::models::media::Frame;
use crate::processing::surface::{Surface, SurfaceHandle};

/// Raw audio capture device.
///
/// Audio is pulled: once capture runs, the audio encoder asks for PCM through
/// [`read_frame`](Self::read_frame) whenever it has room for input.
pub trait AudioSource: Send {
    fn configure(&mut self, config: &AudioConfig) -> Result<(), StreamError>;

    /// Start filling the capture buffer. Failures after this returns go
    /// through `reporter`.
    fn start_capture(&mut self, reporter: FailureReporter) -> Result<(), StreamError>;

    fn stop_capture(&mut self) -> Result<(), StreamError>;

    /// Return one raw frame of at most `max_len` payload bytes, or `None`
    /// when nothing is buffered yet. Must not block.
    fn read_frame(&mut self, max_len: usize) -> Option<Frame>;

    fn release(&mut self);
}

/// Raw video capture device.
///
/// Video is pushed: the source writes raw frames into the encoder's input
/// surface through `encoder`, and optionally into a preview surface.
pub trait VideoSource: Send {
    fn configure(&mut self, config: &VideoConfig) -> Result<(), StreamError>;

    /// Open `device_id` and start delivering frames.
    ///
    /// `encoder` stays valid until the session rebinds or revokes the
    /// encoder surface; frames submitted through a stale handle are dropped.
    fn start_capture(
        &mut self,
        device_id: &str,
        encoder: SurfaceHandle,
        preview: Option<Surface>,
        reporter: FailureReporter,
    ) -> Result<(), StreamError>;

    fn stop_capture(&mut self) -> Result<(), StreamError>;

    fn release(&mut self);
}
