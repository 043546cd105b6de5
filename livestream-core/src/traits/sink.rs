use crate::models::error::StreamError;
use crate::models::events::FailureReporter;

/// Destination of the muxed byte stream (file, socket, protocol client).
///
/// `write` is only ever called from the session's sink writer thread, one
/// chunk at a time and in muxer output order. A failed write is never
/// retried; the session stops the stream and raises connection-lost.
pub trait Sink: Send {
    /// Hint the expected bitrate (audio + video start bitrates, in bits/s).
    fn configure(&mut self, target_bitrate: u32) -> Result<(), StreamError>;

    /// Open the destination. Disconnects noticed outside `write` go through
    /// `reporter`.
    fn start(&mut self, reporter: FailureReporter) -> Result<(), StreamError>;

    fn write(&mut self, data: &[u8]) -> Result<(), StreamError>;

    /// Flush and close the destination.
    fn stop(&mut self) -> Result<(), StreamError>;

    fn release(&mut self);
}
