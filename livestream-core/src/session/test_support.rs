//! In-memory sources, encoders and sinks for driving a session in tests.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::models::config::{AudioConfig, MediaConfig, VideoConfig};
use crate::models::error::StreamError;
use crate::models::events::FailureReporter;
use crate::models::media::{Frame, MediaKind, MimeType};
use crate::processing::surface::{SubmitOutcome, Surface, SurfaceHandle};
use crate::session::orchestrator::Components;
use crate::traits::encoder::{Encoder, EncoderInput, FrameCallback};
use crate::traits::sink::Sink;
use crate::traits::source::{AudioSource, VideoSource};

#[derive(Default)]
pub struct AudioSourceProbe {
    pub configured: Option<AudioConfig>,
    pub capturing: bool,
    pub starts: u32,
    pub reads: u32,
    pub released: bool,
    pub reporter: Option<FailureReporter>,
}

pub struct FakeAudioSource(pub Arc<Mutex<AudioSourceProbe>>);

impl AudioSource for FakeAudioSource {
    fn configure(&mut self, config: &AudioConfig) -> Result<(), StreamError> {
        self.0.lock().configured = Some(config.clone());
        Ok(())
    }

    fn start_capture(&mut self, reporter: FailureReporter) -> Result<(), StreamError> {
        let mut probe = self.0.lock();
        probe.capturing = true;
        probe.starts += 1;
        probe.reporter = Some(reporter);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), StreamError> {
        self.0.lock().capturing = false;
        Ok(())
    }

    fn read_frame(&mut self, max_len: usize) -> Option<Frame> {
        let mut probe = self.0.lock();
        if !probe.capturing {
            return None;
        }
        probe.reads += 1;
        let pts = probe.reads as i64 * 21_333;
        Some(Frame::new(vec![0u8; max_len.min(4096)], pts, MimeType::Aac))
    }

    fn release(&mut self) {
        let mut probe = self.0.lock();
        probe.capturing = false;
        probe.released = true;
    }
}

#[derive(Default)]
pub struct VideoSourceProbe {
    pub device_id: Option<String>,
    pub handle: Option<SurfaceHandle>,
    pub preview: Option<Surface>,
    pub starts: u32,
    pub capturing: bool,
    pub released: bool,
    pub reporter: Option<FailureReporter>,
}

impl VideoSourceProbe {
    /// Write a raw frame through the current encoder handle.
    pub fn submit(&self, pts: i64) -> SubmitOutcome {
        match &self.handle {
            Some(handle) => handle.submit(Frame::new(vec![0u8; 64], pts, MimeType::Avc)),
            None => SubmitOutcome::Stale,
        }
    }
}

pub struct FakeVideoSource(pub Arc<Mutex<VideoSourceProbe>>);

impl VideoSource for FakeVideoSource {
    fn configure(&mut self, _config: &VideoConfig) -> Result<(), StreamError> {
        Ok(())
    }

    fn start_capture(
        &mut self,
        device_id: &str,
        encoder: SurfaceHandle,
        preview: Option<Surface>,
        reporter: FailureReporter,
    ) -> Result<(), StreamError> {
        let mut probe = self.0.lock();
        probe.device_id = Some(device_id.to_string());
        probe.handle = Some(encoder);
        probe.preview = preview;
        probe.starts += 1;
        probe.capturing = true;
        probe.reporter = Some(reporter);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), StreamError> {
        self.0.lock().capturing = false;
        Ok(())
    }

    fn release(&mut self) {
        let mut probe = self.0.lock();
        probe.capturing = false;
        probe.released = true;
    }
}

#[derive(Default)]
pub struct EncoderProbe {
    pub configures: u32,
    pub releases: u32,
    pub starts: u32,
    pub stops: u32,
    pub running: bool,
    /// Leave the mime type unnegotiated after configure.
    pub withhold_mime: bool,
    pub mime_type: Option<MimeType>,
    pub surface: Option<Surface>,
    pub input: Option<EncoderInput>,
    pub output: Option<FrameCallback>,
    pub reporter: Option<FailureReporter>,
}

impl EncoderProbe {
    pub fn fail(&self, error: StreamError) {
        if let Some(reporter) = &self.reporter {
            reporter.report(error);
        }
    }
}

pub struct FakeEncoder {
    kind: MediaKind,
    probe: Arc<Mutex<EncoderProbe>>,
}

impl FakeEncoder {
    pub fn new(kind: MediaKind, probe: Arc<Mutex<EncoderProbe>>) -> Self {
        Self { kind, probe }
    }
}

impl Encoder for FakeEncoder {
    fn configure(&mut self, config: &MediaConfig) -> Result<(), StreamError> {
        if config.kind() != self.kind {
            return Err(StreamError::Configuration("wrong media kind".into()));
        }
        let mut probe = self.probe.lock();
        probe.configures += 1;
        probe.mime_type = (!probe.withhold_mime).then(|| config.mime_type());
        if self.kind == MediaKind::Video {
            probe.surface = Some(Surface::new(4));
        }
        Ok(())
    }

    fn mime_type(&self) -> Option<MimeType> {
        self.probe.lock().mime_type
    }

    fn input_surface(&self) -> Option<Surface> {
        self.probe.lock().surface.clone()
    }

    fn start(
        &mut self,
        input: EncoderInput,
        output: FrameCallback,
        reporter: FailureReporter,
    ) -> Result<(), StreamError> {
        let mut probe = self.probe.lock();
        probe.starts += 1;
        probe.running = true;
        probe.input = Some(input);
        probe.output = Some(output);
        probe.reporter = Some(reporter);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        let mut probe = self.probe.lock();
        probe.stops += 1;
        probe.running = false;
        Ok(())
    }

    fn release(&mut self) {
        let mut probe = self.probe.lock();
        probe.releases += 1;
        probe.running = false;
        probe.mime_type = None;
        probe.surface = None;
    }
}

#[derive(Default)]
pub struct SinkProbe {
    pub target_bitrate: Option<u32>,
    pub data: Vec<u8>,
    pub writes: u32,
    pub starts: u32,
    pub stops: u32,
    pub fail_writes: bool,
    pub released: bool,
}

pub struct FakeSink(pub Arc<Mutex<SinkProbe>>);

impl Sink for FakeSink {
    fn configure(&mut self, target_bitrate: u32) -> Result<(), StreamError> {
        self.0.lock().target_bitrate = Some(target_bitrate);
        Ok(())
    }

    fn start(&mut self, _reporter: FailureReporter) -> Result<(), StreamError> {
        self.0.lock().starts += 1;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let mut probe = self.0.lock();
        probe.writes += 1;
        if probe.fail_writes {
            return Err(StreamError::ConnectionLost("peer reset".into()));
        }
        probe.data.extend_from_slice(data);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.0.lock().stops += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.0.lock().released = true;
    }
}

/// Handles on every fake behind a session.
#[derive(Default, Clone)]
pub struct Probes {
    pub audio_source: Arc<Mutex<AudioSourceProbe>>,
    pub video_source: Arc<Mutex<VideoSourceProbe>>,
    pub audio_encoder: Arc<Mutex<EncoderProbe>>,
    pub video_encoder: Arc<Mutex<EncoderProbe>>,
    pub sink: Arc<Mutex<SinkProbe>>,
}

impl Probes {
    pub fn components(&self) -> Components {
        Components {
            audio_source: Box::new(FakeAudioSource(Arc::clone(&self.audio_source))),
            video_source: Box::new(FakeVideoSource(Arc::clone(&self.video_source))),
            audio_encoder: Box::new(FakeEncoder::new(
                MediaKind::Audio,
                Arc::clone(&self.audio_encoder),
            )),
            video_encoder: Box::new(FakeEncoder::new(
                MediaKind::Video,
                Arc::clone(&self.video_encoder),
            )),
            sink: Box::new(FakeSink(Arc::clone(&self.sink))),
        }
    }

    /// Deliver an encoded video frame as the codec thread would.
    pub fn emit_video(&self, pts: i64, key_frame: bool) {
        let mut payload = vec![0x00, 0x00, 0x00, 0x01, if key_frame { 0x65 } else { 0x41 }];
        payload.extend_from_slice(&[0x88; 200]);
        let mut frame = Frame::new(payload, pts, MimeType::Avc);
        if key_frame {
            frame = frame.key_frame().with_extra(vec![
                Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F]),
                Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xEE]),
            ]);
        }
        // clone the callback out so the probe lock is not held while muxing
        let output = self.video_encoder.lock().output.clone();
        if let Some(output) = output {
            output(frame);
        }
    }

    pub fn emit_audio(&self, pts: i64) {
        let output = self.audio_encoder.lock().output.clone();
        if let Some(output) = output {
            output(Frame::new(vec![0x21; 180], pts, MimeType::Aac));
        }
    }
}
