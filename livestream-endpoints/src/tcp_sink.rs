use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use livestream_core::{FailureReporter, Sink, StreamError};

use crate::error::{self, EndpointError};

/// Seven TS packets, the usual payload for TS over IP.
pub const DEFAULT_SEND_SIZE: usize = 7 * 188;

#[derive(Debug, Clone)]
pub struct TcpSinkOptions {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Output is coalesced into sends of at least this many bytes.
    pub send_size: usize,
}

impl Default for TcpSinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            send_size: DEFAULT_SEND_SIZE,
        }
    }
}

struct Connection {
    stream: TcpStream,
    closing: Arc<AtomicBool>,
    monitor: Option<thread::JoinHandle<()>>,
}

impl Connection {
    fn close(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        // Unblocks the monitor's read.
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                log::error!("tcp monitor thread panicked");
            }
        }
    }
}

/// Streams the muxed container to a TCP peer.
///
/// A connection is opened on `start` and closed on `stop`. Write failures
/// come back from `write`; a peer that hangs up while no write is pending is
/// noticed by a monitor thread and raised through the failure reporter.
pub struct TcpSink {
    addr: String,
    options: TcpSinkOptions,
    pending: BytesMut,
    connection: Option<Connection>,
}

impl TcpSink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_options(addr, TcpSinkOptions::default())
    }

    pub fn with_options(addr: impl Into<String>, options: TcpSinkOptions) -> Self {
        Self {
            addr: addr.into(),
            pending: BytesMut::with_capacity(options.send_size * 2),
            options,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn connect(&self) -> Result<TcpStream, EndpointError> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(EndpointError::io("address lookup failed"))?
            .collect();

        let mut last = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::debug!("connect to {} failed: {}", addr, e);
                    last = e;
                }
            }
        }
        Err(EndpointError::Io {
            context: "connect failed",
            source: last,
        })
    }

    fn flush_pending(&mut self) -> Result<(), EndpointError> {
        let connection = self.connection.as_mut().ok_or(EndpointError::NotStarted)?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        connection
            .stream
            .write_all(&chunk)
            .map_err(EndpointError::io("send failed"))
    }
}

/// Watch for the peer closing the connection. Anything the peer sends is
/// discarded.
fn spawn_monitor(
    mut stream: TcpStream,
    closing: Arc<AtomicBool>,
    reporter: FailureReporter,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tcp-sink-monitor".into())
        .spawn(move || {
            let mut buf = [0u8; 512];
            let reason = loop {
                match stream.read(&mut buf) {
                    Ok(0) => break "peer closed the connection".to_string(),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if error::is_disconnect(e.kind()) => break e.to_string(),
                    Err(e) => break format!("connection error: {}", e),
                }
            };
            if !closing.load(Ordering::SeqCst) {
                log::warn!("tcp sink: {}", reason);
                reporter.report(StreamError::ConnectionLost(reason));
            }
        })
        .expect("failed to spawn tcp monitor thread")
}

impl Sink for TcpSink {
    fn configure(&mut self, target_bitrate: u32) -> Result<(), StreamError> {
        log::debug!("tcp sink expects {} b/s to {}", target_bitrate, self.addr);
        Ok(())
    }

    fn start(&mut self, reporter: FailureReporter) -> Result<(), StreamError> {
        if self.connection.is_some() {
            return Err(StreamError::State("tcp sink already connected".into()));
        }
        let stream = self.connect()?;
        stream
            .set_write_timeout(Some(self.options.write_timeout))
            .map_err(EndpointError::io("set write timeout failed"))?;
        stream
            .set_nodelay(true)
            .map_err(EndpointError::io("set nodelay failed"))?;
        let reader = stream
            .try_clone()
            .map_err(EndpointError::io("clone socket failed"))?;

        let closing = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor(reader, Arc::clone(&closing), reporter);
        log::info!("tcp sink connected to {}", self.addr);

        self.pending.clear();
        self.connection = Some(Connection {
            stream,
            closing,
            monitor: Some(monitor),
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.connection.is_none() {
            return Err(EndpointError::NotStarted.into());
        }
        self.pending.extend_from_slice(data);
        if self.pending.len() >= self.options.send_size {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if self.connection.is_none() {
            return Ok(());
        }
        let flushed = self.flush_pending();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.pending.clear();
        log::info!("tcp sink disconnected from {}", self.addr);
        Ok(flushed?)
    }

    fn release(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("tcp sink release: {}", e);
        }
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::mpsc;

    use livestream_core::FailureOrigin;

    use super::*;

    fn listener() -> (TcpListener, String) {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn delivers_coalesced_output() {
        let (listener, addr) = listener();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).unwrap();
            received
        });

        let (tx, rx) = mpsc::channel();
        let mut sink = TcpSink::new(addr);
        sink.start(FailureReporter::new(FailureOrigin::Sink, 1, tx)).unwrap();
        assert!(sink.is_connected());
        for i in 0..10u8 {
            sink.write(&[i; 188]).unwrap();
        }
        sink.stop().unwrap();
        assert!(!sink.is_connected());

        let received = server.join().unwrap();
        assert_eq!(received.len(), 1880);
        assert_eq!(received[188 * 9], 9);
        // Our own shutdown is not a lost connection.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn peer_hangup_is_reported() {
        let (listener, addr) = listener();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let (tx, rx) = mpsc::channel();
        let mut sink = TcpSink::new(addr);
        sink.start(FailureReporter::new(FailureOrigin::Sink, 7, tx)).unwrap();
        server.join().unwrap();

        let report = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(report.origin, FailureOrigin::Sink);
        assert_eq!(report.epoch, 7);
        assert!(matches!(report.error, StreamError::ConnectionLost(_)));
        sink.release();
    }

    #[test]
    fn refused_connection_fails_start() {
        let (listener, addr) = listener();
        drop(listener);

        let (tx, _rx) = mpsc::channel();
        let mut sink = TcpSink::with_options(
            addr,
            TcpSinkOptions {
                connect_timeout: Duration::from_millis(500),
                ..TcpSinkOptions::default()
            },
        );
        let err = sink.start(FailureReporter::new(FailureOrigin::Sink, 1, tx)).unwrap_err();
        assert!(matches!(err, StreamError::Sink(_) | StreamError::ConnectionLost(_)));
        assert!(!sink.is_connected());
    }

    #[test]
    fn write_before_start_fails() {
        let mut sink = TcpSink::new("127.0.0.1:9");
        assert!(sink.write(&[0x47; 188]).is_err());
        assert!(sink.stop().is_ok());
    }
}
