use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use livestream_core::{FailureReporter, Sink, StreamError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::EndpointError;

/// Totals of the last file a [`FileSink`] finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSummary {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
}

/// Read side of a [`FileSink`] that stays usable after the sink is boxed
/// into a session.
#[derive(Debug, Clone, Default)]
pub struct FileSinkHandle {
    last: Arc<Mutex<Option<FileSummary>>>,
}

impl FileSinkHandle {
    /// Summary of the most recently finished file, if any.
    pub fn last_file(&self) -> Option<FileSummary> {
        self.last.lock().clone()
    }
}

struct OpenFile {
    writer: BufWriter<File>,
    hasher: Sha256,
    bytes_written: u64,
}

/// Writes the muxed container to a file, one file per streaming run.
///
/// The file is created (or truncated) on `start` and finalized on `stop`,
/// where its SHA-256 checksum is computed from the bytes as they were
/// written.
pub struct FileSink {
    path: PathBuf,
    target_bitrate: u32,
    file: Option<OpenFile>,
    released: bool,
    handle: FileSinkHandle,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            target_bitrate: 0,
            file: None,
            released: false,
            handle: FileSinkHandle::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> FileSinkHandle {
        self.handle.clone()
    }

    /// Bytes written to the current file so far.
    pub fn bytes_written(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.bytes_written)
    }

    fn open(&mut self) -> Result<(), EndpointError> {
        if self.released {
            return Err(EndpointError::Released);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(EndpointError::io("failed to create directory"))?;
        }
        let file = File::create(&self.path).map_err(EndpointError::io("failed to create file"))?;

        // Roughly one second of output per buffered write.
        let capacity = (self.target_bitrate as usize / 8).clamp(8 * 1024, 1024 * 1024);
        self.file = Some(OpenFile {
            writer: BufWriter::with_capacity(capacity, file),
            hasher: Sha256::new(),
            bytes_written: 0,
        });
        log::info!("writing stream to {}", self.path.display());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EndpointError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.writer.flush().map_err(EndpointError::io("flush failed"))?;
        file.writer
            .get_ref()
            .sync_all()
            .map_err(EndpointError::io("sync failed"))?;

        let summary = FileSummary {
            path: self.path.clone(),
            bytes_written: file.bytes_written,
            checksum: hex_encode(&file.hasher.finalize()),
        };
        log::info!(
            "finished {} ({} bytes, sha256 {})",
            summary.path.display(),
            summary.bytes_written,
            summary.checksum
        );
        *self.handle.last.lock() = Some(summary);
        Ok(())
    }
}

impl Sink for FileSink {
    fn configure(&mut self, target_bitrate: u32) -> Result<(), StreamError> {
        self.target_bitrate = target_bitrate;
        Ok(())
    }

    fn start(&mut self, _reporter: FailureReporter) -> Result<(), StreamError> {
        if self.file.is_some() {
            log::warn!("file sink restarted without stop; finishing previous file");
            self.finish()?;
        }
        Ok(self.open()?)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let file = self.file.as_mut().ok_or(EndpointError::NotStarted)?;
        file.writer
            .write_all(data)
            .map_err(EndpointError::io("write failed"))?;
        file.hasher.update(data);
        file.bytes_written += data.len() as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        Ok(self.finish()?)
    }

    fn release(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("file sink release: {}", e);
        }
        self.released = true;
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
