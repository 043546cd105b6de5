use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::models::events::{FailureOrigin, FailureReport};

/// How often the supervisor re-checks its running flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Teardown chosen for a failure, by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// A capture device failed: stop streaming and capture.
    StopStreamAndCapture,
    /// A codec or the muxer failed: stop streaming, capture continues.
    StopStream,
    /// The sink can no longer deliver: stop streaming, raise connection-lost.
    ConnectionLost,
}

impl Recovery {
    pub fn for_origin(origin: FailureOrigin) -> Self {
        match origin {
            FailureOrigin::Source(_) => Self::StopStreamAndCapture,
            FailureOrigin::Encoder(_) | FailureOrigin::Muxer => Self::StopStream,
            FailureOrigin::Sink => Self::ConnectionLost,
        }
    }
}

/// Receives failure reports on the supervisor thread.
pub trait FailureHandler: Send + Sync + 'static {
    fn handle_failure(&self, report: FailureReport);
}

/// Background thread that serializes failure handling.
///
/// Collaborators report from their own threads; the supervisor hands each
/// report to the handler one at a time, so teardown never runs on a capture
/// or codec thread and never races another teardown.
pub struct Supervisor {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Supervisor {
    pub fn start<H: FailureHandler>(reports: Receiver<FailureReport>, handler: Arc<H>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("stream-supervisor".into())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    let report = match reports.recv_timeout(POLL_INTERVAL) {
                        Ok(report) => report,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let origin = report.origin;
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| handler.handle_failure(report)));
                    if result.is_err() {
                        log::error!("panic while handling {} failure", origin);
                    }
                }
                log::debug!("supervisor stopped");
            })
            .expect("failed to spawn supervisor thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it. Reports still queued are dropped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("supervisor thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use parking_lot::Mutex;

    use super::*;
    use crate::models::error::StreamError;
    use crate::models::events::FailureReporter;
    use crate::models::media::MediaKind;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<FailureOrigin>>,
    }

    impl FailureHandler for Recorder {
        fn handle_failure(&self, report: FailureReport) {
            if report.origin == FailureOrigin::Muxer {
                panic!("handler blew up");
            }
            self.seen.lock().push(report.origin);
        }
    }

    fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..100 {
            if recorder.seen.lock().len() >= count {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("handler saw {} reports", recorder.seen.lock().len());
    }

    #[test]
    fn recovery_by_origin() {
        assert_eq!(
            Recovery::for_origin(FailureOrigin::Source(MediaKind::Video)),
            Recovery::StopStreamAndCapture
        );
        assert_eq!(
            Recovery::for_origin(FailureOrigin::Encoder(MediaKind::Audio)),
            Recovery::StopStream
        );
        assert_eq!(Recovery::for_origin(FailureOrigin::Muxer), Recovery::StopStream);
        assert_eq!(Recovery::for_origin(FailureOrigin::Sink), Recovery::ConnectionLost);
    }

    #[test]
    fn reports_reach_handler_in_order() {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Recorder::default());
        let mut supervisor = Supervisor::start(rx, Arc::clone(&recorder));

        FailureReporter::new(FailureOrigin::Sink, 1, tx.clone())
            .report(StreamError::Sink("closed".into()));
        FailureReporter::new(FailureOrigin::Encoder(MediaKind::Video), 1, tx)
            .report(StreamError::Codec("stalled".into()));

        wait_for(&recorder, 2);
        assert_eq!(
            *recorder.seen.lock(),
            vec![FailureOrigin::Sink, FailureOrigin::Encoder(MediaKind::Video)]
        );
        supervisor.stop();
        assert!(!supervisor.is_running());
    }

    #[test]
    fn survives_panicking_handler() {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Recorder::default());
        let _supervisor = Supervisor::start(rx, Arc::clone(&recorder));

        FailureReporter::new(FailureOrigin::Muxer, 1, tx.clone())
            .report(StreamError::Codec("boom".into()));
        FailureReporter::new(FailureOrigin::Sink, 1, tx).report(StreamError::Sink("x".into()));

        wait_for(&recorder, 1);
        assert_eq!(*recorder.seen.lock(), vec![FailureOrigin::Sink]);
    }
}
