use std::io;

use livestream_core::StreamError;
use thiserror::Error;

/// Failures of the concrete sinks, before they are handed to the session.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("sink is not started")]
    NotStarted,

    #[error("sink has been released")]
    Released,
}

impl EndpointError {
    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }

    /// Whether the failure means the peer is gone rather than a local fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_disconnect(source.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            // Write timeouts surface as WouldBlock on unix.
            | io::ErrorKind::WouldBlock
    )
}

impl From<EndpointError> for StreamError {
    fn from(e: EndpointError) -> Self {
        if e.is_disconnect() {
            StreamError::ConnectionLost(e.to_string())
        } else {
            StreamError::Sink(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnects_map_to_connection_lost() {
        let e = EndpointError::Io {
            context: "write failed",
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(matches!(StreamError::from(e), StreamError::ConnectionLost(_)));

        let e = EndpointError::Io {
            context: "create failed",
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(matches!(StreamError::from(e), StreamError::Sink(_)));
        assert_eq!(
            StreamError::from(EndpointError::NotStarted),
            StreamError::Sink("sink is not started".into())
        );
    }
}
