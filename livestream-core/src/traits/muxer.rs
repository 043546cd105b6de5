use std::sync::Arc;

use bytes::Bytes;

use crate::models::config::{ContainerFormat, MediaConfig};
use crate::models::error::MuxError;
use crate::models::media::{Frame, MimeType, ServiceInfo, StreamDescriptor};

/// Receives muxed container bytes. Called on whichever thread drove the
/// muxer (encoder output threads, or the caller of [`Muxer::stop`]).
pub type MuxerOutput = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;

/// Container multiplexer.
///
/// Lifecycle per streaming session:
/// ```text
/// add_service → add_streams → encode* → stop
/// ```
/// After `stop` the muxer is empty again and accepts a new service.
pub trait Muxer: Send {
    fn container(&self) -> ContainerFormat;

    /// Register the one service of this session.
    fn add_service(&mut self, service: ServiceInfo) -> Result<(), MuxError>;

    /// Declare the streams of `service`, assigning ids in input order.
    fn add_streams(
        &mut self,
        service: &ServiceInfo,
        configs: &[MediaConfig],
    ) -> Result<Vec<StreamDescriptor>, MuxError>;

    /// Streams declared since the last `stop`, in declaration order.
    fn streams(&self) -> Vec<StreamDescriptor>;

    /// Id of the first declared stream carrying `mime_type`.
    fn stream_id(&self, mime_type: MimeType) -> Option<u16> {
        self.streams()
            .into_iter()
            .find(|stream| stream.mime_type == mime_type)
            .map(|stream| stream.stream_id)
    }

    /// Mux one encoded frame into stream `stream_id`.
    fn encode(&mut self, frame: Frame, stream_id: u16) -> Result<(), MuxError>;

    /// Flush, write the trailer, hand out the final bytes and reset.
    fn stop(&mut self) -> Result<(), MuxError>;
}
