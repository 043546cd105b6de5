use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::models::error::StreamError;
use crate::models::events::FailureReporter;
use crate::processing::packet_queue::PacketQueue;
use crate::traits::sink::Sink;

/// Drains the output queue into the sink on its own thread.
///
/// The first failed write is reported once; after that the writer keeps
/// draining and discarding so encoder threads never stall on a dead sink.
pub struct SinkWriter {
    queue: Arc<PacketQueue>,
    bytes_written: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SinkWriter {
    /// Start draining `queue`, which must already be open.
    pub fn start(
        queue: Arc<PacketQueue>,
        sink: Arc<Mutex<Box<dyn Sink>>>,
        reporter: FailureReporter,
    ) -> Self {
        let bytes_written = Arc::new(AtomicU64::new(0));
        let written = Arc::clone(&bytes_written);
        let input = Arc::clone(&queue);

        let handle = thread::Builder::new()
            .name("sink-writer".into())
            .spawn(move || {
                let mut failed = false;
                while let Some(chunk) = input.pop() {
                    if failed {
                        continue;
                    }
                    match sink.lock().write(&chunk) {
                        Ok(()) => {
                            written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            log::warn!("sink write failed, discarding output: {}", e);
                            failed = true;
                            input.discard();
                            let reason = match e {
                                StreamError::ConnectionLost(reason) => reason,
                                other => other.to_string(),
                            };
                            reporter.report(StreamError::ConnectionLost(reason));
                        }
                    }
                }
            })
            .expect("failed to spawn sink writer thread");

        Self {
            queue,
            bytes_written,
            handle: Some(handle),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Close the queue, let the thread write what is left and join it.
    /// Returns the total bytes the sink accepted.
    pub fn finish(mut self) -> u64 {
        self.join();
        self.bytes_written()
    }

    fn join(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("sink writer thread panicked");
            }
        }
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.join();
    }
}
