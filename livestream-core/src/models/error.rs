use thiserror::Error;

/// Errors surfaced by the streaming session and its collaborators.
///
/// Variants double as the failure taxonomy: the orchestrator picks its
/// teardown path from the variant (see `session::supervisor`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Invalid or unsupported configuration, reported before streaming starts.
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// A command issued out of lifecycle order.
    #[error("invalid state: {0}")]
    State(String),

    /// A source failed while capturing.
    #[error("capture failed: {0}")]
    Capture(String),

    /// An encoder failed while streaming.
    #[error("codec failed: {0}")]
    Codec(String),

    /// A sink write or control call failed.
    #[error("sink failed: {0}")]
    Sink(String),

    /// The sink lost its connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The multiplexer rejected a declaration or a frame.
    #[error("mux failed: {0}")]
    Mux(#[from] MuxError),
}

/// Errors produced by the multiplexing engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("unsupported mime type for {container}: {mime_type}")]
    UnsupportedMimeType {
        container: &'static str,
        mime_type: String,
    },

    #[error("service must be added before streams")]
    MissingService,

    #[error("a service is already registered (id {0})")]
    ServiceAlreadyRegistered(u16),

    #[error("unknown service id {0}")]
    UnknownService(u16),

    #[error("no streams declared")]
    NoStreams,

    #[error("unknown stream id {0}")]
    UnknownStream(u16),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("table does not fit in a single packet: {0}")]
    TableTooLarge(String),
}
