//! MPEG transport stream multiplexer.
//!
//! One program per session. Tables (PAT, PMT, SDT) go out before the first
//! payload after a declaration, in front of video key frames, and on the
//! configured interval; each access unit is wrapped in a PES packet and split
//! into 188-byte packets with a per-PID continuity counter.

pub mod packet;
pub mod psi;

use bytes::{Bytes, BytesMut};

use crate::models::config::{ContainerFormat, MediaConfig, TableRefreshPolicy};
use crate::models::error::MuxError;
use crate::models::media::{Frame, MimeType, ServiceInfo, StreamDescriptor};
use crate::mux::{adts, nal};
use crate::traits::muxer::{Muxer, MuxerOutput};

use packet::{packetize, pes_header, to_90khz, write_section, ContinuityCounter};
use psi::{PmtEntry, PAT_PID, PMT_PID, SDT_PID};

/// First elementary stream PID; later streams follow in declaration order.
pub const FIRST_STREAM_PID: u16 = 0x0100;

const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;
const PRIVATE_STREAM_1: u8 = 0xBD;

/// Opus control header prefix (0x3FF, no trim, no extension).
const OPUS_CONTROL_PREFIX: [u8; 2] = [0x7F, 0xE0];

#[derive(Debug)]
struct TsStream {
    descriptor: StreamDescriptor,
    config: MediaConfig,
    cc: ContinuityCounter,
    /// Parameter sets (video) seen in `Frame::extra`, re-sent on key frames.
    codec_data: Option<Bytes>,
}

impl TsStream {
    fn pid(&self) -> u16 {
        self.descriptor.stream_id
    }

    fn pes_stream_id(&self) -> u8 {
        match self.descriptor.mime_type {
            MimeType::Avc | MimeType::Hevc => VIDEO_STREAM_ID,
            MimeType::Aac => AUDIO_STREAM_ID,
            MimeType::Opus => PRIVATE_STREAM_1,
        }
    }

    fn pmt_entry(&self) -> PmtEntry {
        PmtEntry {
            mime_type: self.descriptor.mime_type,
            pid: self.pid(),
            channel_count: self.config.as_audio().map_or(0, |a| a.channel_count),
        }
    }
}

/// Counters since the last `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsMuxStats {
    pub packets_written: u64,
    pub table_emissions: u64,
    pub frames: u64,
}

pub struct TsMuxer {
    output: MuxerOutput,
    refresh: TableRefreshPolicy,
    service: Option<ServiceInfo>,
    streams: Vec<TsStream>,
    pat_cc: ContinuityCounter,
    pmt_cc: ContinuityCounter,
    sdt_cc: ContinuityCounter,
    tables_pending: bool,
    last_tables_pts: Option<i64>,
    stats: TsMuxStats,
}

impl TsMuxer {
    pub fn new(refresh: TableRefreshPolicy, output: MuxerOutput) -> Self {
        Self {
            output,
            refresh,
            service: None,
            streams: Vec::new(),
            pat_cc: ContinuityCounter::default(),
            pmt_cc: ContinuityCounter::default(),
            sdt_cc: ContinuityCounter::default(),
            tables_pending: false,
            last_tables_pts: None,
            stats: TsMuxStats::default(),
        }
    }

    pub fn stats(&self) -> TsMuxStats {
        self.stats
    }

    /// PCR rides on the first video stream, else on the first stream.
    fn pcr_pid(&self) -> Option<u16> {
        self.streams
            .iter()
            .find(|s| s.descriptor.mime_type.is_video())
            .or_else(|| self.streams.first())
            .map(TsStream::pid)
    }

    fn pmt_section(&self, program_number: u16) -> Vec<u8> {
        let entries: Vec<PmtEntry> = self.streams.iter().map(TsStream::pmt_entry).collect();
        psi::pmt(program_number, self.pcr_pid().unwrap_or(0x1FFF), &entries)
    }

    fn tables_due(&self, frame: &Frame) -> bool {
        if self.tables_pending {
            return true;
        }
        if self.refresh.on_key_frame && frame.is_key_frame && frame.mime_type.is_video() {
            return true;
        }
        match (self.refresh.interval_ms, self.last_tables_pts) {
            (_, None) => true,
            (Some(interval_ms), Some(last)) => frame.pts - last >= interval_ms as i64 * 1000,
            (None, Some(_)) => false,
        }
    }

    fn write_tables(&mut self, out: &mut BytesMut, service: &ServiceInfo) -> Result<(), MuxError> {
        let pmt = self.pmt_section(service.id);
        write_section(out, PAT_PID, &mut self.pat_cc, &psi::pat(service.id), "PAT")?;
        write_section(out, PMT_PID, &mut self.pmt_cc, &pmt, "PMT")?;
        write_section(out, SDT_PID, &mut self.sdt_cc, &psi::sdt(service), "SDT")?;
        self.stats.packets_written += 3;
        self.stats.table_emissions += 1;
        Ok(())
    }

    /// Elementary stream bytes for one access unit.
    fn elementary_payload(stream: &mut TsStream, frame: &Frame) -> Result<Vec<u8>, MuxError> {
        let mime_type = stream.descriptor.mime_type;
        match &stream.config {
            MediaConfig::Video(_) => {
                if let Some(extra) = &frame.extra {
                    let sets = nal::ParameterSets::collect(extra.iter().map(|b| b.as_ref()), mime_type);
                    if !sets.is_empty() {
                        stream.codec_data = Some(Bytes::from(sets.to_annexb()));
                    }
                }
                let mut payload = Vec::with_capacity(frame.payload.len() + 64);
                if frame.is_key_frame && !nal::contains_sps(&frame.payload, mime_type) {
                    if let Some(codec_data) = &stream.codec_data {
                        payload.extend_from_slice(codec_data);
                    }
                }
                payload.extend_from_slice(&frame.payload);
                Ok(payload)
            }
            MediaConfig::Audio(config) if mime_type == MimeType::Aac => {
                if adts::has_adts_header(&frame.payload) {
                    return Ok(frame.payload.to_vec());
                }
                let header = adts::adts_header(config, frame.payload.len())?;
                let mut payload = Vec::with_capacity(header.len() + frame.payload.len());
                payload.extend_from_slice(&header);
                payload.extend_from_slice(&frame.payload);
                Ok(payload)
            }
            MediaConfig::Audio(_) => {
                let mut payload = Vec::with_capacity(frame.payload.len() + 8);
                payload.extend_from_slice(&OPUS_CONTROL_PREFIX);
                let mut size = frame.payload.len();
                while size >= 0xFF {
                    payload.push(0xFF);
                    size -= 0xFF;
                }
                payload.push(size as u8);
                payload.extend_from_slice(&frame.payload);
                Ok(payload)
            }
        }
    }

    fn reset(&mut self) {
        self.service = None;
        self.streams.clear();
        self.pat_cc.reset();
        self.pmt_cc.reset();
        self.sdt_cc.reset();
        self.tables_pending = false;
        self.last_tables_pts = None;
        self.stats = TsMuxStats::default();
    }
}

impl Muxer for TsMuxer {
    fn container(&self) -> ContainerFormat {
        ContainerFormat::Ts
    }

    fn add_service(&mut self, service: ServiceInfo) -> Result<(), MuxError> {
        if let Some(existing) = &self.service {
            return Err(MuxError::ServiceAlreadyRegistered(existing.id));
        }
        log::debug!("ts service 0x{:04x} \"{}\" registered", service.id, service.name);
        self.service = Some(service);
        Ok(())
    }

    fn add_streams(
        &mut self,
        service: &ServiceInfo,
        configs: &[MediaConfig],
    ) -> Result<Vec<StreamDescriptor>, MuxError> {
        let registered = self.service.as_ref().ok_or(MuxError::MissingService)?;
        if registered.id != service.id {
            return Err(MuxError::UnknownService(service.id));
        }
        if configs.is_empty() {
            return Err(MuxError::NoStreams);
        }

        let first_new = self.streams.len();
        let mut next_pid = self
            .streams
            .last()
            .map_or(FIRST_STREAM_PID, |s| s.pid() + 1);

        for config in configs {
            let descriptor = StreamDescriptor {
                mime_type: config.mime_type(),
                stream_id: next_pid,
            };
            next_pid += 1;
            self.streams.push(TsStream {
                descriptor,
                config: config.clone(),
                cc: ContinuityCounter::default(),
                codec_data: None,
            });
        }

        // PMT and SDT must each fit in one packet.
        let pmt = self.pmt_section(service.id);
        if !packet::section_fits(&pmt) {
            self.streams.truncate(first_new);
            return Err(MuxError::TableTooLarge(format!(
                "PMT with {} streams",
                first_new + configs.len()
            )));
        }
        let sdt = psi::sdt(service);
        if !packet::section_fits(&sdt) {
            self.streams.truncate(first_new);
            return Err(MuxError::TableTooLarge(format!(
                "SDT section is {} bytes",
                sdt.len()
            )));
        }

        self.tables_pending = true;
        let added: Vec<StreamDescriptor> =
            self.streams[first_new..].iter().map(|s| s.descriptor).collect();
        for descriptor in &added {
            log::debug!("ts stream {} on pid 0x{:04x}", descriptor.mime_type, descriptor.stream_id);
        }
        Ok(added)
    }

    fn streams(&self) -> Vec<StreamDescriptor> {
        self.streams.iter().map(|s| s.descriptor).collect()
    }

    fn encode(&mut self, mut frame: Frame, stream_id: u16) -> Result<(), MuxError> {
        let service = self.service.clone().ok_or(MuxError::MissingService)?;
        if self.streams.is_empty() {
            return Err(MuxError::NoStreams);
        }
        frame.validate()?;

        let index = self
            .streams
            .iter()
            .position(|s| s.pid() == stream_id)
            .ok_or(MuxError::UnknownStream(stream_id))?;
        if self.streams[index].descriptor.mime_type != frame.mime_type {
            return Err(MuxError::InvalidFrame(format!(
                "{} frame sent to {} stream {}",
                frame.mime_type, self.streams[index].descriptor.mime_type, stream_id
            )));
        }
        frame.stream_id = Some(stream_id);

        let mut out = BytesMut::with_capacity(frame.payload.len() + 4 * packet::TS_PACKET_SIZE);
        if self.tables_due(&frame) {
            self.write_tables(&mut out, &service)?;
            self.tables_pending = false;
            self.last_tables_pts = Some(frame.pts);
        }

        let pcr_pid = self.pcr_pid();
        let stream = &mut self.streams[index];
        let payload = Self::elementary_payload(stream, &frame)?;

        let pts = to_90khz(frame.pts);
        let dts = frame.dts.map(to_90khz);
        let is_video = frame.mime_type.is_video();
        let mut pes = pes_header(stream.pes_stream_id(), payload.len(), pts, dts, !is_video);
        pes.extend_from_slice(&payload);

        let pcr = (pcr_pid == Some(stream.pid())).then(|| dts.unwrap_or(pts) * 300);
        let packets = packetize(&mut out, stream.pid(), &mut stream.cc, &pes, pcr);

        self.stats.packets_written += packets as u64;
        self.stats.frames += 1;
        (self.output)(out.freeze());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MuxError> {
        if self.service.is_some() {
            log::debug!(
                "ts muxer stopped: {} frames, {} packets",
                self.stats.frames,
                self.stats.packets_written
            );
        }
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::packet::{SYNC_BYTE, TS_PACKET_SIZE};
    use super::*;
    use crate::models::config::{AudioConfig, VideoConfig};

    fn capture() -> (MuxerOutput, Arc<Mutex<Vec<Bytes>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let output: MuxerOutput = Arc::new(move |bytes: Bytes| sink.lock().push(bytes));
        (output, chunks)
    }

    fn av_configs() -> Vec<MediaConfig> {
        vec![
            MediaConfig::Video(VideoConfig::default()),
            MediaConfig::Audio(AudioConfig::default()),
        ]
    }

    fn declared(refresh: TableRefreshPolicy) -> (TsMuxer, Arc<Mutex<Vec<Bytes>>>) {
        let (output, chunks) = capture();
        let mut muxer = TsMuxer::new(refresh, output);
        let service = ServiceInfo::default();
        muxer.add_service(service.clone()).unwrap();
        muxer.add_streams(&service, &av_configs()).unwrap();
        (muxer, chunks)
    }

    fn pid_of(packet: &[u8]) -> u16 {
        (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
    }

    fn video(pts: i64, len: usize) -> Frame {
        Frame::new(vec![0x41; len], pts, MimeType::Avc)
    }

    fn audio(pts: i64) -> Frame {
        Frame::new(vec![0x21; 300], pts, MimeType::Aac)
    }

    #[test]
    fn stream_ids_follow_declaration_order() {
        let (muxer, _) = declared(TableRefreshPolicy::default());
        let streams = muxer.streams();
        assert_eq!(streams[0], StreamDescriptor { mime_type: MimeType::Avc, stream_id: 0x100 });
        assert_eq!(streams[1], StreamDescriptor { mime_type: MimeType::Aac, stream_id: 0x101 });
        assert_eq!(muxer.stream_id(MimeType::Aac), Some(0x101));
    }

    #[test]
    fn tables_precede_first_payload() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy::default());
        muxer.encode(audio(0), 0x101).unwrap();

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 1, "one output call per encode");
        let pids: Vec<u16> = chunks[0].chunks(TS_PACKET_SIZE).map(pid_of).collect();
        assert_eq!(&pids[..3], &[PAT_PID, PMT_PID, SDT_PID]);
        assert!(pids[3..].iter().all(|&pid| pid == 0x101));
    }

    #[test]
    fn continuity_counters_increment_per_pid() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy {
            on_key_frame: false,
            interval_ms: None,
        });
        for i in 0..40 {
            muxer.encode(video(i * 33_333, 1500), 0x100).unwrap();
            muxer.encode(audio(i * 21_333), 0x101).unwrap();
        }

        let mut last: HashMap<u16, u8> = HashMap::new();
        for chunk in chunks.lock().iter() {
            assert_eq!(chunk.len() % TS_PACKET_SIZE, 0);
            for packet in chunk.chunks(TS_PACKET_SIZE) {
                assert_eq!(packet[0], SYNC_BYTE);
                let pid = pid_of(packet);
                let cc = packet[3] & 0x0F;
                if let Some(prev) = last.insert(pid, cc) {
                    assert_eq!(cc, (prev + 1) % 16, "pid 0x{pid:04x}");
                } else {
                    assert_eq!(cc, 0);
                }
            }
        }
        assert!(muxer.stats().packets_written > 16, "counters wrapped at least once");
    }

    #[test]
    fn key_frames_refresh_tables() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy {
            on_key_frame: true,
            interval_ms: None,
        });
        muxer.encode(video(0, 100).key_frame(), 0x100).unwrap();
        muxer.encode(video(33_333, 100), 0x100).unwrap();
        muxer.encode(video(66_666, 100).key_frame(), 0x100).unwrap();

        let chunks = chunks.lock();
        let starts_with_pat = |c: &Bytes| pid_of(&c[..TS_PACKET_SIZE]) == PAT_PID;
        assert!(starts_with_pat(&chunks[0]));
        assert!(!starts_with_pat(&chunks[1]));
        assert!(starts_with_pat(&chunks[2]));
        assert_eq!(muxer.stats().table_emissions, 2);
    }

    #[test]
    fn interval_refreshes_tables() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy {
            on_key_frame: false,
            interval_ms: Some(100),
        });
        muxer.encode(audio(0), 0x101).unwrap();
        muxer.encode(audio(50_000), 0x101).unwrap();
        muxer.encode(audio(100_000), 0x101).unwrap();

        let chunks = chunks.lock();
        let pid0 = |c: &Bytes| pid_of(&c[..TS_PACKET_SIZE]);
        assert_eq!(pid0(&chunks[0]), PAT_PID);
        assert_eq!(pid0(&chunks[1]), 0x101);
        assert_eq!(pid0(&chunks[2]), PAT_PID);
    }

    #[test]
    fn raw_aac_gets_adts_header() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy::default());
        muxer.encode(audio(0), 0x101).unwrap();

        let chunks = chunks.lock();
        let pes_packet = &chunks[0][3 * TS_PACKET_SIZE..4 * TS_PACKET_SIZE];
        // audio is not the PCR pid: header(4) then PES header(14)
        assert_eq!(pes_packet[3] & 0x30, 0x10);
        assert!(adts::has_adts_header(&pes_packet[4 + 14..]));
    }

    #[test]
    fn key_frames_get_parameter_sets() {
        let (mut muxer, chunks) = declared(TableRefreshPolicy::default());
        let sps = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F]);
        let pps = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xEE]);
        let frame = Frame::new(vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88], 0, MimeType::Avc)
            .key_frame()
            .with_extra(vec![sps, pps]);
        muxer.encode(frame, 0x100).unwrap();

        let chunks = chunks.lock();
        let first_pes = &chunks[0][3 * TS_PACKET_SIZE..];
        assert!(first_pes.windows(5).any(|w| w == [0x00, 0x00, 0x01, 0x67, 0x64]));
    }

    #[test]
    fn opus_frames_get_control_header() {
        let (output, chunks) = capture();
        let mut muxer = TsMuxer::new(TableRefreshPolicy::default(), output);
        let service = ServiceInfo::default();
        muxer.add_service(service.clone()).unwrap();
        let opus = AudioConfig {
            mime_type: MimeType::Opus,
            ..AudioConfig::default()
        };
        muxer.add_streams(&service, &[MediaConfig::Audio(opus)]).unwrap();
        muxer
            .encode(Frame::new(vec![0x5A; 300], 0, MimeType::Opus), 0x100)
            .unwrap();

        let chunks = chunks.lock();
        let es = &chunks[0][3 * TS_PACKET_SIZE..];
        assert!(es.windows(4).any(|w| w == [0x7F, 0xE0, 0xFF, 45]));
    }

    #[test]
    fn rejects_encode_before_declaration() {
        let (output, _) = capture();
        let mut muxer = TsMuxer::new(TableRefreshPolicy::default(), output);
        assert_eq!(muxer.encode(audio(0), 0x101), Err(MuxError::MissingService));

        muxer.add_service(ServiceInfo::default()).unwrap();
        assert_eq!(muxer.encode(audio(0), 0x101), Err(MuxError::NoStreams));
    }

    #[test]
    fn rejects_unknown_stream_and_service() {
        let (mut muxer, _) = declared(TableRefreshPolicy::default());
        assert_eq!(muxer.encode(audio(0), 0x200), Err(MuxError::UnknownStream(0x200)));

        let other = ServiceInfo {
            id: 7,
            ..ServiceInfo::default()
        };
        assert_eq!(
            muxer.add_streams(&other, &av_configs()),
            Err(MuxError::UnknownService(7))
        );
        assert_eq!(
            muxer.add_service(other),
            Err(MuxError::ServiceAlreadyRegistered(ServiceInfo::default().id))
        );
    }

    #[test]
    fn oversized_sdt_rejected_at_declaration() {
        let (output, chunks) = capture();
        let mut muxer = TsMuxer::new(TableRefreshPolicy::default(), output);
        let service = ServiceInfo {
            name: "n".repeat(200),
            ..ServiceInfo::default()
        };
        muxer.add_service(service.clone()).unwrap();

        let err = muxer.add_streams(&service, &av_configs()).unwrap_err();
        assert!(matches!(err, MuxError::TableTooLarge(ref msg) if msg.starts_with("SDT")));
        assert!(muxer.streams().is_empty());
        assert!(chunks.lock().is_empty());
    }

    #[test]
    fn stop_resets_declarations() {
        let (mut muxer, _) = declared(TableRefreshPolicy::default());
        muxer.encode(audio(0), 0x101).unwrap();
        muxer.stop().unwrap();

        assert!(muxer.streams().is_empty());
        let service = ServiceInfo::default();
        muxer.add_service(service.clone()).unwrap();
        let streams = muxer.add_streams(&service, &av_configs()).unwrap();
        assert_eq!(streams[0].stream_id, FIRST_STREAM_PID);
    }
}
