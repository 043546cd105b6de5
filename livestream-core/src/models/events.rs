use std::fmt;
use std::sync::mpsc::{Receiver, Sender};

use super::error::StreamError;
use super::media::MediaKind;
use super::state::SessionState;

/// Which collaborator reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureOrigin {
    Source(MediaKind),
    Encoder(MediaKind),
    Muxer,
    Sink,
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(MediaKind::Audio) => f.write_str("audio source"),
            Self::Source(MediaKind::Video) => f.write_str("video source"),
            Self::Encoder(MediaKind::Audio) => f.write_str("audio encoder"),
            Self::Encoder(MediaKind::Video) => f.write_str("video encoder"),
            Self::Muxer => f.write_str("muxer"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// A capture, codec or mux failure, delivered after teardown completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub origin: FailureOrigin,
    pub error: StreamError,
}

/// The sink can no longer deliver bytes; streaming has been stopped.
///
/// Configuration and capture are intact, so a caller may reconnect and call
/// `start_stream` again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLostEvent {
    pub reason: String,
}

/// Receiving ends of the session's notification channels.
///
/// Each concern has exactly one subscriber: whoever holds this struct.
/// Error and connection-lost events come from the session's supervisor
/// thread; state changes from whichever thread drove the transition. None
/// are ever sent from capture or codec threads.
pub struct SessionEvents {
    pub errors: Receiver<ErrorEvent>,
    pub connection_lost: Receiver<ConnectionLostEvent>,
    pub states: Receiver<SessionState>,
}

/// A failure as raised by a collaborator, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub origin: FailureOrigin,
    pub error: StreamError,
    /// Capture or stream epoch the reporter was issued for.
    pub epoch: u64,
}

/// Handed to sources, encoders and sinks when they start.
///
/// Reporting never blocks and never tears anything down on the calling
/// thread: the report is queued for the session's supervisor, which ignores
/// it when the epoch it was issued for has already ended.
#[derive(Debug, Clone)]
pub struct FailureReporter {
    origin: FailureOrigin,
    epoch: u64,
    tx: Sender<FailureReport>,
}

impl FailureReporter {
    pub fn new(origin: FailureOrigin, epoch: u64, tx: Sender<FailureReport>) -> Self {
        Self { origin, epoch, tx }
    }

    pub fn origin(&self) -> FailureOrigin {
        self.origin
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn report(&self, error: StreamError) {
        let report = FailureReport {
            origin: self.origin,
            error,
            epoch: self.epoch,
        };
        if self.tx.send(report).is_err() {
            log::debug!("{} failure dropped: session already released", self.origin);
        }
    }
}
