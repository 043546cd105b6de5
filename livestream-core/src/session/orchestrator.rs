use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::config::{AudioConfig, MediaConfig, SessionSettings, VideoConfig};
use crate::models::error::{MuxError, StreamError};
use crate::models::events::{
    ConnectionLostEvent, ErrorEvent, FailureOrigin, FailureReport, FailureReporter, SessionEvents,
};
use crate::models::media::{Frame, MediaKind, StreamDescriptor};
use crate::models::state::SessionState;
use crate::models::stream_report::{StreamReport, StreamSummary};
use crate::mux;
use crate::processing::packet_queue::PacketQueue;
use crate::processing::surface::{Surface, SurfaceSlot};
use crate::processing::timestamp::TimestampSynchronizer;
use crate::session::supervisor::{FailureHandler, Recovery, Supervisor};
use crate::session::writer::SinkWriter;
use crate::traits::encoder::{Encoder, EncoderInput, FrameCallback, InputRequest};
use crate::traits::muxer::{Muxer, MuxerOutput};
use crate::traits::sink::Sink;
use crate::traits::source::{AudioSource, VideoSource};
use crate::traits::streamer::Streamer;

/// Longest an audio input request waits for the source lock.
const SOURCE_LOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// The collaborators a session drives.
pub struct Components {
    pub audio_source: Box<dyn AudioSource>,
    pub video_source: Box<dyn VideoSource>,
    pub audio_encoder: Box<dyn Encoder>,
    pub video_encoder: Box<dyn Encoder>,
    pub sink: Box<dyn Sink>,
}

/// Synchronizer and muxer behind one lock, so both streams are normalized and
/// muxed in the order their frames arrive.
struct MuxPipeline {
    synchronizer: TimestampSynchronizer,
    muxer: Box<dyn Muxer>,
}

struct Notifier {
    errors: Sender<ErrorEvent>,
    connection_lost: Sender<ConnectionLostEvent>,
    states: Sender<SessionState>,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: SessionState,
    capturing: bool,
}

struct RunCounters {
    /// Frames muxed, indexed like `StreamRun::streams`.
    frames: Vec<AtomicU64>,
    dropped_frames: AtomicU64,
}

/// One start_stream .. stop_stream cycle.
struct StreamRun {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    streams: Vec<StreamDescriptor>,
    /// Closed first on stop; frames arriving afterwards are dropped.
    gate: Arc<AtomicBool>,
    counters: Arc<RunCounters>,
    writer: Option<SinkWriter>,
}

/// Command-side state, serialized by the control lock.
struct Control {
    released: bool,
    audio_config: Option<AudioConfig>,
    video_config: Option<VideoConfig>,
    device_id: String,
    preview: Option<Surface>,
    video_source: Box<dyn VideoSource>,
    audio_encoder: Box<dyn Encoder>,
    video_encoder: Box<dyn Encoder>,
    run: Option<StreamRun>,
}

/// Everything shared between the command surface and the supervisor thread.
struct SessionCore {
    settings: SessionSettings,
    control: Mutex<Control>,
    status: Mutex<Status>,
    audio_source: Arc<Mutex<Box<dyn AudioSource>>>,
    sink: Arc<Mutex<Box<dyn Sink>>>,
    mux: Arc<Mutex<MuxPipeline>>,
    queue: Arc<PacketQueue>,
    slot: SurfaceSlot,
    failures: Sender<FailureReport>,
    /// Bumped whenever capture starts or stops.
    capture_epoch: AtomicU64,
    /// Bumped whenever a stream starts or stops.
    stream_epoch: AtomicU64,
    notifier: Notifier,
}

/// Live streaming session: capture → encode → synchronize → mux → sink.
///
/// Wiring:
/// ```text
/// [AudioSource] ←pull─ [AudioEncoder] ─┐
///                                       ├→ [Synchronizer → Muxer] → [PacketQueue] → writer → [Sink]
/// [VideoSource] →surface→ [VideoEncoder]┘
/// ```
///
/// Commands take `&self` and are serialized by an internal lock; the session
/// can be shared across threads. Collaborator failures are handled on a
/// supervisor thread, which tears down what the failure requires and then
/// notifies through the [`SessionEvents`] returned by [`StreamSession::new`].
pub struct StreamSession {
    core: Arc<SessionCore>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl StreamSession {
    pub fn new(
        components: Components,
        settings: SessionSettings,
    ) -> Result<(Self, SessionEvents), StreamError> {
        settings.validate()?;

        let (failures_tx, failures_rx) = mpsc::channel();
        let (errors_tx, errors) = mpsc::channel();
        let (connection_lost_tx, connection_lost) = mpsc::channel();
        let (states_tx, states) = mpsc::channel();

        let queue = Arc::new(PacketQueue::new(settings.output_queue_bytes, settings.overflow));
        let muxer = mux::create_muxer(&settings, queue_output(Arc::clone(&queue)));

        let Components {
            audio_source,
            video_source,
            audio_encoder,
            video_encoder,
            sink,
        } = components;

        let core = Arc::new(SessionCore {
            control: Mutex::new(Control {
                released: false,
                audio_config: None,
                video_config: None,
                device_id: settings.default_camera_id.clone(),
                preview: None,
                video_source,
                audio_encoder,
                video_encoder,
                run: None,
            }),
            settings,
            status: Mutex::new(Status {
                state: SessionState::Idle,
                capturing: false,
            }),
            audio_source: Arc::new(Mutex::new(audio_source)),
            sink: Arc::new(Mutex::new(sink)),
            mux: Arc::new(Mutex::new(MuxPipeline {
                synchronizer: TimestampSynchronizer::new(),
                muxer,
            })),
            queue,
            slot: SurfaceSlot::new(),
            failures: failures_tx,
            capture_epoch: AtomicU64::new(0),
            stream_epoch: AtomicU64::new(0),
            notifier: Notifier {
                errors: errors_tx,
                connection_lost: connection_lost_tx,
                states: states_tx,
            },
        });
        let supervisor = Supervisor::start(failures_rx, Arc::clone(&core));

        log::debug!(
            "stream session created ({} container)",
            core.settings.container.name()
        );
        Ok((
            Self {
                core,
                supervisor: Mutex::new(Some(supervisor)),
            },
            SessionEvents {
                errors,
                connection_lost,
                states,
            },
        ))
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.core.settings
    }

    /// Streams declared for the running stream, in declaration order.
    pub fn streams(&self) -> Vec<StreamDescriptor> {
        self.core
            .control
            .lock()
            .run
            .as_ref()
            .map(|run| run.streams.clone())
            .unwrap_or_default()
    }
}

impl Streamer for StreamSession {
    fn state(&self) -> SessionState {
        self.core.status.lock().state
    }

    fn is_capturing(&self) -> bool {
        self.core.status.lock().capturing
    }

    fn configure(&self, audio: Option<AudioConfig>, video: VideoConfig) -> Result<(), StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        self.core.configure_locked(&mut control, audio, video)
    }

    fn start_capture(&self, preview: Option<Surface>, device_id: &str) -> Result<(), StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        self.core.start_capture_locked(&mut control, preview, device_id)
    }

    fn switch_camera(&self, device_id: &str) -> Result<(), StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        self.core.switch_camera_locked(&mut control, device_id)
    }

    fn start_stream(&self) -> Result<(), StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        self.core.start_stream_locked(&mut control)
    }

    fn stop_stream(&self) -> Result<Option<StreamReport>, StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        self.core.stop_stream_locked(&mut control)
    }

    fn stop_capture(&self) -> Result<(), StreamError> {
        let mut control = self.core.control.lock();
        self.core.ensure_live(&control)?;
        if control.run.is_some() {
            log::info!("stopping capture while streaming; stopping the stream first");
            if let Err(e) = self.core.stop_stream_locked(&mut control) {
                log::warn!("stream teardown before capture stop: {}", e);
            }
        }
        self.core.stop_capture_locked(&mut control)
    }

    fn release(&self) {
        {
            let mut control = self.core.control.lock();
            if control.released {
                return;
            }
            self.core.release_locked(&mut control);
        }
        // Outside the control lock: the supervisor may be waiting for it.
        if let Some(mut supervisor) = self.supervisor.lock().take() {
            supervisor.stop();
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Muxer output: queue chunks for the sink writer, warning on drops at
/// powers of two so a stalled sink does not flood the log.
fn queue_output(queue: Arc<PacketQueue>) -> MuxerOutput {
    let last_warned = AtomicU64::new(0);
    Arc::new(move |chunk: Bytes| {
        queue.push(chunk);
        let dropped = queue.stats().dropped_chunks;
        if dropped.is_power_of_two() && last_warned.swap(dropped, Ordering::Relaxed) != dropped {
            log::warn!(
                "sink falling behind: {} output chunks dropped ({} bytes queued)",
                dropped,
                queue.queued_bytes()
            );
        }
    })
}

fn negotiated(encoder: &dyn Encoder, mut config: MediaConfig) -> Result<MediaConfig, StreamError> {
    let kind = config.kind();
    let mime_type = encoder.mime_type().ok_or_else(|| {
        StreamError::State(format!(
            "{} has no negotiated mime type",
            FailureOrigin::Encoder(kind)
        ))
    })?;
    match &mut config {
        MediaConfig::Audio(audio) => audio.mime_type = mime_type,
        MediaConfig::Video(video) => video.mime_type = mime_type,
    }
    Ok(config)
}

impl SessionCore {
    fn ensure_live(&self, control: &Control) -> Result<(), StreamError> {
        if control.released {
            return Err(StreamError::State("session has been released".into()));
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let previous = {
            let mut status = self.status.lock();
            std::mem::replace(&mut status.state, state)
        };
        if previous != state {
            log::debug!("session state {} → {}", previous.name(), state.name());
            // No subscriber is fine.
            let _ = self.notifier.states.send(state);
        }
    }

    fn set_capturing(&self, capturing: bool) {
        self.status.lock().capturing = capturing;
    }

    fn is_capturing(&self) -> bool {
        self.status.lock().capturing
    }

    fn reporter(&self, origin: FailureOrigin, epoch: u64) -> FailureReporter {
        FailureReporter::new(origin, epoch, self.failures.clone())
    }

    // --- Commands ---

    fn configure_locked(
        &self,
        control: &mut Control,
        audio: Option<AudioConfig>,
        video: VideoConfig,
    ) -> Result<(), StreamError> {
        if control.run.is_some() || self.is_capturing() {
            return Err(StreamError::State(
                "cannot configure while capturing or streaming".into(),
            ));
        }

        video.validate()?;
        if let Some(audio) = &audio {
            audio.validate()?;
        }
        let container = self.settings.container;
        let mime_types = std::iter::once(video.mime_type).chain(audio.iter().map(|a| a.mime_type));
        for mime_type in mime_types {
            if !mux::supports(container, mime_type) {
                return Err(StreamError::Configuration(format!(
                    "{} cannot carry {}",
                    container.name(),
                    mime_type
                )));
            }
        }

        control.video_source.configure(&video)?;
        control.video_encoder.release();
        control
            .video_encoder
            .configure(&MediaConfig::Video(video.clone()))?;

        control.audio_encoder.release();
        if let Some(audio) = &audio {
            self.audio_source.lock().configure(audio)?;
            control
                .audio_encoder
                .configure(&MediaConfig::Audio(audio.clone()))?;
        }

        let bitrate = video
            .start_bitrate
            .saturating_add(audio.as_ref().map_or(0, |a| a.start_bitrate));
        self.sink.lock().configure(bitrate)?;

        log::info!(
            "configured: video {} {}x{}@{} {} b/s, audio {}",
            video.mime_type,
            video.resolution.width,
            video.resolution.height,
            video.fps,
            video.start_bitrate,
            audio
                .as_ref()
                .map_or_else(|| "none".to_string(), |a| a.mime_type.to_string())
        );
        control.video_config = Some(video);
        control.audio_config = audio;
        self.set_state(SessionState::Configured);
        Ok(())
    }

    fn start_capture_locked(
        &self,
        control: &mut Control,
        preview: Option<Surface>,
        device_id: &str,
    ) -> Result<(), StreamError> {
        if control.video_config.is_none() {
            return Err(StreamError::State("start_capture before configure".into()));
        }
        if self.is_capturing() {
            return Err(StreamError::State("capture already running".into()));
        }
        let device_id = self.camera_or_default(device_id);

        let epoch = self.capture_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.start_video_capture(control, &device_id, preview.clone(), epoch)?;

        if control.audio_config.is_some() {
            let reporter = self.reporter(FailureOrigin::Source(MediaKind::Audio), epoch);
            if let Err(e) = self.audio_source.lock().start_capture(reporter) {
                if let Err(stop) = control.video_source.stop_capture() {
                    log::warn!("video capture stop after audio failure: {}", stop);
                }
                self.slot.revoke();
                return Err(e);
            }
        }

        control.device_id = device_id;
        control.preview = preview;
        self.set_capturing(true);
        self.set_state(SessionState::Capturing);
        log::info!("capture started on camera {}", control.device_id);
        Ok(())
    }

    /// Bind the encoder surface and start the video source on `device_id`.
    fn start_video_capture(
        &self,
        control: &mut Control,
        device_id: &str,
        preview: Option<Surface>,
        epoch: u64,
    ) -> Result<(), StreamError> {
        let surface = control.video_encoder.input_surface().ok_or_else(|| {
            StreamError::Configuration("video encoder exposes no input surface".into())
        })?;
        let handle = self.slot.bind(surface);
        if control.run.is_some() {
            self.slot.set_flowing(true);
        }
        let reporter = self.reporter(FailureOrigin::Source(MediaKind::Video), epoch);
        if let Err(e) = control
            .video_source
            .start_capture(device_id, handle, preview, reporter)
        {
            self.slot.revoke();
            return Err(e);
        }
        Ok(())
    }

    fn switch_camera_locked(&self, control: &mut Control, device_id: &str) -> Result<(), StreamError> {
        if !self.is_capturing() {
            return Err(StreamError::State("switch_camera while not capturing".into()));
        }
        let device_id = self.camera_or_default(device_id);
        control.video_source.stop_capture()?;
        let preview = control.preview.clone();
        let epoch = self.capture_epoch.load(Ordering::SeqCst);
        if let Err(e) = self.start_video_capture(control, &device_id, preview, epoch) {
            log::error!("camera {} failed to start: {}", device_id, e);
            self.stop_capture_locked(control)?;
            return Err(e);
        }
        log::info!("switched camera {} → {}", control.device_id, device_id);
        control.device_id = device_id;
        Ok(())
    }

    /// An empty id selects the configured default camera.
    fn camera_or_default(&self, device_id: &str) -> String {
        if device_id.is_empty() {
            self.settings.default_camera_id.clone()
        } else {
            device_id.to_string()
        }
    }

    fn start_stream_locked(&self, control: &mut Control) -> Result<(), StreamError> {
        if control.run.is_some() {
            return Err(StreamError::State("already streaming".into()));
        }
        let video = control
            .video_config
            .clone()
            .ok_or_else(|| StreamError::State("video is not configured".into()))?;
        let audio = control
            .audio_config
            .clone()
            .ok_or_else(|| StreamError::State("streaming needs an audio configuration".into()))?;
        if !self.is_capturing() {
            return Err(StreamError::State("start_stream before start_capture".into()));
        }

        // Video first, then audio.
        let configs = vec![
            negotiated(control.video_encoder.as_ref(), MediaConfig::Video(video))?,
            negotiated(control.audio_encoder.as_ref(), MediaConfig::Audio(audio))?,
        ];

        let epoch = self.stream_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let streams = self.declare_streams(&configs)?;

        self.queue.open();
        if let Err(e) = self
            .sink
            .lock()
            .start(self.reporter(FailureOrigin::Sink, epoch))
        {
            self.abort_declaration();
            return Err(e);
        }
        let writer = SinkWriter::start(
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
            self.reporter(FailureOrigin::Sink, epoch),
        );

        let gate = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(RunCounters {
            frames: streams.iter().map(|_| AtomicU64::new(0)).collect(),
            dropped_frames: AtomicU64::new(0),
        });
        control.run = Some(StreamRun {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            streams: streams.clone(),
            gate: Arc::clone(&gate),
            counters: Arc::clone(&counters),
            writer: Some(writer),
        });
        self.set_state(SessionState::Streaming);
        self.slot.set_flowing(true);

        if let Err(e) = self.start_encoders(control, &streams, &gate, &counters, epoch) {
            log::error!("encoder start failed: {}", e);
            if let Err(teardown) = self.stop_stream_locked(control) {
                log::warn!("teardown after failed start: {}", teardown);
            }
            return Err(e);
        }

        log::info!(
            "stream started: {}",
            streams
                .iter()
                .map(|s| format!("{}@{}", s.mime_type, s.stream_id))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Reset the timeline and declare the service and streams on the muxer.
    fn declare_streams(&self, configs: &[MediaConfig]) -> Result<Vec<StreamDescriptor>, StreamError> {
        let mut mux = self.mux.lock();
        mux.synchronizer.reset();
        let service = self.settings.service.clone();
        let declared = mux
            .muxer
            .add_service(service.clone())
            .and_then(|()| mux.muxer.add_streams(&service, configs));
        match declared {
            Ok(streams) if !streams.is_empty() => Ok(streams),
            declared => {
                if let Err(e) = mux.muxer.stop() {
                    log::warn!("muxer reset after failed declaration: {}", e);
                }
                match declared {
                    Ok(_) | Err(MuxError::NoStreams) => {
                        Err(StreamError::State("no streams to declare".into()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Undo a declaration whose stream never started; nothing reaches the sink.
    fn abort_declaration(&self) {
        self.queue.close();
        if let Err(e) = self.mux.lock().muxer.stop() {
            log::warn!("muxer reset after aborted start: {}", e);
        }
        self.queue.discard();
    }

    fn start_encoders(
        &self,
        control: &mut Control,
        streams: &[StreamDescriptor],
        gate: &Arc<AtomicBool>,
        counters: &Arc<RunCounters>,
        epoch: u64,
    ) -> Result<(), StreamError> {
        for (index, stream) in streams.iter().enumerate() {
            let kind = stream.mime_type.kind();
            let output = self.frame_output(index, stream.stream_id, gate, counters, epoch);
            let reporter = self.reporter(FailureOrigin::Encoder(kind), epoch);
            match kind {
                MediaKind::Video => {
                    control
                        .video_encoder
                        .start(EncoderInput::Surface, output, reporter)?;
                }
                MediaKind::Audio => {
                    let source = Arc::clone(&self.audio_source);
                    let request: InputRequest = Arc::new(move |max_len: usize| {
                        source.try_lock_for(SOURCE_LOCK_TIMEOUT)?.read_frame(max_len)
                    });
                    control
                        .audio_encoder
                        .start(EncoderInput::Pull(request), output, reporter)?;
                }
            }
        }
        Ok(())
    }

    /// Encoder output for stream `index`: gate, normalize, mux.
    fn frame_output(
        &self,
        index: usize,
        stream_id: u16,
        gate: &Arc<AtomicBool>,
        counters: &Arc<RunCounters>,
        epoch: u64,
    ) -> FrameCallback {
        let gate = Arc::clone(gate);
        let counters = Arc::clone(counters);
        let mux = Arc::clone(&self.mux);
        let reporter = self.reporter(FailureOrigin::Muxer, epoch);

        Arc::new(move |frame: Frame| {
            if !gate.load(Ordering::Acquire) {
                counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                log::trace!("dropping {} frame after stop", frame.mime_type);
                return;
            }
            let mut mux = mux.lock();
            // Re-checked under the lock: stop closes the gate before flushing.
            if !gate.load(Ordering::Acquire) {
                counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let frame = mux.synchronizer.normalize(frame);
            match mux.muxer.encode(frame, stream_id) {
                Ok(()) => {
                    counters.frames[index].fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    log::error!("muxer rejected frame for stream {}: {}", stream_id, e);
                    reporter.report(e.into());
                }
            }
        })
    }

    fn stop_stream_locked(&self, control: &mut Control) -> Result<Option<StreamReport>, StreamError> {
        let Some(mut run) = control.run.take() else {
            return Ok(None);
        };
        self.set_state(SessionState::Stopping);
        // Reports from this run are stale from here on.
        self.stream_epoch.fetch_add(1, Ordering::SeqCst);
        run.gate.store(false, Ordering::Release);
        self.slot.set_flowing(false);

        if let Err(e) = control.video_encoder.stop() {
            log::warn!("video encoder stop: {}", e);
        }
        if let Err(e) = control.audio_encoder.stop() {
            log::warn!("audio encoder stop: {}", e);
        }

        // Final bytes (MP4 trailer) go through the queue before it closes.
        if let Err(e) = self.mux.lock().muxer.stop() {
            log::warn!("muxer stop: {}", e);
        }
        let bytes_written = run.writer.take().map_or(0, SinkWriter::finish);
        let queue_stats = self.queue.stats();
        if let Err(e) = self.sink.lock().stop() {
            log::warn!("sink stop: {}", e);
        }

        let report = StreamReport {
            session_id: run.session_id,
            started_at: run.started_at,
            duration_secs: run.started.elapsed().as_secs_f64(),
            container: self.settings.container,
            streams: run
                .streams
                .iter()
                .zip(&run.counters.frames)
                .map(|(stream, frames)| StreamSummary {
                    stream_id: stream.stream_id,
                    mime_type: stream.mime_type,
                    frames: frames.load(Ordering::Relaxed),
                })
                .collect(),
            bytes_written,
            dropped_chunks: queue_stats.dropped_chunks,
            dropped_frames: run.counters.dropped_frames.load(Ordering::Relaxed),
        };
        log::info!(
            "stream stopped after {:.1}s: {} bytes written, {} chunks dropped",
            report.duration_secs,
            report.bytes_written,
            report.dropped_chunks
        );

        // Encoders do not return to a configured state after a stop.
        // Capture keeps running; it is tracked apart from the state.
        let reconfigured = self.reconfigure_encoders(control);
        self.set_state(SessionState::Configured);
        reconfigured.map(|()| Some(report))
    }

    /// Release and configure both encoders with the last configuration, then
    /// hand the video source the new encoder surface.
    fn reconfigure_encoders(&self, control: &mut Control) -> Result<(), StreamError> {
        control.audio_encoder.release();
        if let Some(audio) = &control.audio_config {
            control
                .audio_encoder
                .configure(&MediaConfig::Audio(audio.clone()))?;
        }

        control.video_encoder.release();
        let Some(video) = control.video_config.clone() else {
            return Ok(());
        };
        control.video_encoder.configure(&MediaConfig::Video(video))?;

        if self.is_capturing() {
            if let Err(e) = control.video_source.stop_capture() {
                log::warn!("video capture stop before rebind: {}", e);
            }
            let device_id = control.device_id.clone();
            let preview = control.preview.clone();
            let epoch = self.capture_epoch.load(Ordering::SeqCst);
            if let Err(e) = self.start_video_capture(control, &device_id, preview, epoch) {
                log::error!("video capture restart after reconfigure failed: {}", e);
                self.stop_capture_locked(control)?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn stop_capture_locked(&self, control: &mut Control) -> Result<(), StreamError> {
        if !self.is_capturing() {
            return Ok(());
        }
        self.capture_epoch.fetch_add(1, Ordering::SeqCst);

        let video = control.video_source.stop_capture();
        let audio = if control.audio_config.is_some() {
            self.audio_source.lock().stop_capture()
        } else {
            Ok(())
        };
        self.slot.revoke();
        self.set_capturing(false);
        if control.run.is_none() {
            self.set_state(SessionState::Configured);
        }
        log::info!("capture stopped");
        video.and(audio)
    }

    fn release_locked(&self, control: &mut Control) {
        if let Err(e) = self.stop_stream_locked(control) {
            log::warn!("stream teardown during release: {}", e);
        }
        if let Err(e) = self.stop_capture_locked(control) {
            log::warn!("capture stop during release: {}", e);
        }

        control.video_source.release();
        self.audio_source.lock().release();
        control.video_encoder.release();
        control.audio_encoder.release();
        self.sink.lock().release();
        self.slot.revoke();
        self.queue.close();

        control.released = true;
        control.audio_config = None;
        control.video_config = None;
        control.preview = None;
        // Reports still in flight belong to nothing now.
        self.capture_epoch.fetch_add(1, Ordering::SeqCst);
        self.stream_epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Idle);
        log::info!("session released");
    }

    // --- Failure handling ---

    fn current_epoch(&self, origin: FailureOrigin) -> u64 {
        match origin {
            FailureOrigin::Source(_) => self.capture_epoch.load(Ordering::SeqCst),
            _ => self.stream_epoch.load(Ordering::SeqCst),
        }
    }

    fn recover(&self, control: &mut Control, recovery: Recovery) -> Result<(), StreamError> {
        let stopped = self.stop_stream_locked(control).map(|_| ());
        if recovery == Recovery::StopStreamAndCapture {
            self.stop_capture_locked(control)?;
        }
        stopped
    }

    /// Drop whatever a panicking teardown left behind.
    fn abandon(&self, control: &mut Control) {
        if let Some(run) = control.run.take() {
            run.gate.store(false, Ordering::Release);
            self.queue.close();
        }
        self.slot.set_flowing(false);
        self.stream_epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Configured);
    }

    fn notify(&self, recovery: Recovery, report: FailureReport) {
        let origin = report.origin;
        let sent = match recovery {
            Recovery::ConnectionLost => {
                let reason = match report.error {
                    StreamError::ConnectionLost(reason) => reason,
                    other => other.to_string(),
                };
                self.notifier
                    .connection_lost
                    .send(ConnectionLostEvent { reason })
                    .is_ok()
            }
            Recovery::StopStream | Recovery::StopStreamAndCapture => self
                .notifier
                .errors
                .send(ErrorEvent {
                    origin,
                    error: report.error,
                })
                .is_ok(),
        };
        if !sent {
            log::debug!("no subscriber for {} failure", origin);
        }
    }
}

impl FailureHandler for SessionCore {
    fn handle_failure(&self, report: FailureReport) {
        let recovery = Recovery::for_origin(report.origin);
        {
            let mut control = self.control.lock();
            if control.released {
                log::debug!("{} failure after release: {}", report.origin, report.error);
                return;
            }
            if report.epoch != self.current_epoch(report.origin) {
                log::warn!(
                    "ignoring stale {} failure (epoch {}): {}",
                    report.origin,
                    report.epoch,
                    report.error
                );
                return;
            }

            log::error!("{} failed: {}", report.origin, report.error);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.recover(&mut control, recovery)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("teardown after {} failure: {}", report.origin, e),
                Err(_) => {
                    log::error!("teardown after {} failure panicked", report.origin);
                    self.abandon(&mut control);
                }
            }
            // One notification per episode, whatever teardown managed.
            match report.origin {
                FailureOrigin::Source(_) => self.capture_epoch.fetch_add(1, Ordering::SeqCst),
                _ => self.stream_epoch.fetch_add(1, Ordering::SeqCst),
            };
        }
        self.notify(recovery, report);
    }
}
