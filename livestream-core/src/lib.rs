//! # livestream-core
//!
//! Platform-agnostic live streaming core.
//!
//! Drives an audio and a video source through their encoders, puts both
//! encoded streams on one timeline and multiplexes them into MPEG-TS or MP4
//! for an output sink. Platform backends (cameras, microphones, hardware
//! codecs, network endpoints) implement the collaborator traits and plug into
//! [`StreamSession`].
//!
//! ## Architecture
//!
//! ```text
//! livestream-core (this crate)
//! ├── traits/       ← AudioSource, VideoSource, Encoder, Muxer, Sink, Streamer
//! ├── models/       ← StreamError, SessionState, configs, Frame, events, StreamReport
//! ├── processing/   ← TimestampSynchronizer, PacketQueue, SurfaceSlot
//! ├── mux/          ← TsMuxer, Mp4Muxer, NAL and ADTS helpers
//! └── session/      ← StreamSession, supervisor, sink writer
//! ```

pub mod models;
pub mod mux;
pub mod processing;
pub mod session;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use models::config::{
    AudioConfig, ContainerFormat, MediaConfig, OverflowPolicy, SessionSettings,
    TableRefreshPolicy, VideoConfig,
};
pub use models::error::{MuxError, StreamError};
pub use models::events::{
    ConnectionLostEvent, ErrorEvent, FailureOrigin, FailureReporter, SessionEvents,
};
pub use models::media::{Frame, MediaKind, MimeType, ServiceInfo, ServiceType, StreamDescriptor};
pub use models::state::SessionState;
pub use models::stream_report::{StreamReport, StreamSummary};
pub use mux::mp4::Mp4Muxer;
pub use mux::ts::TsMuxer;
pub use processing::packet_queue::PacketQueue;
pub use processing::surface::{SubmitOutcome, Surface, SurfaceHandle, SurfaceSlot};
pub use processing::timestamp::TimestampSynchronizer;
pub use session::{Components, StreamSession};
pub use traits::encoder::{Encoder, EncoderInput, FrameCallback, InputRequest};
pub use traits::muxer::{Muxer, MuxerOutput};
pub use traits::sink::Sink;
pub use traits::source::{AudioSource, VideoSource};
pub use traits::streamer::Streamer;
