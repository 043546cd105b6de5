//! # livestream-endpoints
//!
//! Concrete output sinks for livestream-core.
//!
//! Provides:
//! - `FileSink`: writes the muxed container to disk, SHA-256 checksum on stop
//! - `TcpSink`: streams the container to a TCP peer, reporting hang-ups
//!
//! ## Usage
//! ```ignore
//! use livestream_core::{Components, SessionSettings, StreamSession, Streamer};
//! use livestream_endpoints::TcpSink;
//!
//! let components = Components {
//!     sink: Box::new(TcpSink::new("192.168.1.20:9000")),
//!     ..platform_components()
//! };
//! let (session, events) = StreamSession::new(components, SessionSettings::default())?;
//! ```

pub mod error;
pub mod file_sink;
pub mod tcp_sink;

pub use error::EndpointError;
pub use file_sink::{FileSink, FileSinkHandle, FileSummary};
pub use tcp_sink::{TcpSink, TcpSinkOptions};
