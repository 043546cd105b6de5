use std::sync::Arc;

use crate::models::config::MediaConfig;
use crate::models::error::StreamError;
use crate::models::events::FailureReporter;
use crate::models::media::{Frame, MimeType};
use crate::processing::surface::Surface;

/// Callback invoked with each encoded access unit, in container order.
///
/// Fires on the encoder's own output thread; keep the work short.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync + 'static>;

/// Pull-mode input request: the encoder asks for a raw frame of at most the
/// given payload size and gets one back synchronously, or `None` when the
/// source has nothing yet.
pub type InputRequest = Arc<dyn Fn(usize) -> Option<Frame> + Send + Sync + 'static>;

/// How an encoder receives raw frames.
#[derive(Clone)]
pub enum EncoderInput {
    /// The encoder calls the request whenever it wants input (audio).
    Pull(InputRequest),
    /// A source writes into the encoder's [`Encoder::input_surface`] (video).
    Surface,
}

impl EncoderInput {
    pub fn is_surface(&self) -> bool {
        matches!(self, Self::Surface)
    }
}

/// Audio or video codec.
///
/// Implemented by platform codec wrappers. An encoder serves one media kind;
/// it may be configured, started and stopped many times, and is reconfigured
/// from scratch after every stream.
pub trait Encoder: Send {
    /// Apply `config`. On success [`mime_type`](Self::mime_type) reports the
    /// negotiated output format.
    fn configure(&mut self, config: &MediaConfig) -> Result<(), StreamError>;

    /// Output mime type negotiated by the last successful `configure`.
    fn mime_type(&self) -> Option<MimeType>;

    /// Surface a video source should write into. `None` for pull encoders.
    fn input_surface(&self) -> Option<Surface>;

    /// Start encoding. Encoded frames go to `output`; failures after this
    /// returns go through `reporter`. Output may keep arriving on the
    /// encoder's thread until [`stop`](Self::stop) returns.
    fn start(
        &mut self,
        input: EncoderInput,
        output: FrameCallback,
        reporter: FailureReporter,
    ) -> Result<(), StreamError>;

    fn stop(&mut self) -> Result<(), StreamError>;

    /// Free codec resources. A released encoder must be configured again
    /// before the next start.
    fn release(&mut self);
}
