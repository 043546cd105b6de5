//! ISO base media file multiplexer.
//!
//! Samples are buffered as they arrive; `stop` writes the whole file
//! (`ftyp`, `mdat`, `moov`) in one output call. Each sample is its own chunk,
//! so the sample tables stay trivial and offsets point straight into `mdat`.

pub mod boxes;
pub mod sample_entry;

use bytes::{BufMut, Bytes, BytesMut};

use crate::models::config::{ContainerFormat, MediaConfig, VideoConfig};
use crate::models::error::MuxError;
use crate::models::media::{Frame, MimeType, ServiceInfo, StreamDescriptor};
use crate::mux::{adts, nal};
use crate::traits::muxer::{Muxer, MuxerOutput};

use boxes::{
    write_box, write_chunk_offsets, write_ctts, write_dinf, write_ftyp, write_hdlr, write_mdhd,
    write_mvhd, write_smhd, write_stsc, write_stss, write_stts, write_tkhd, write_vmhd,
    SampleSizeBox, MOVIE_TIMESCALE, MP4_EPOCH_OFFSET, VIDEO_TIMESCALE,
};
use sample_entry::{write_aac_stsd, write_avc_stsd};

/// Track ids are 1-based.
pub const FIRST_TRACK_ID: u16 = 1;

/// AAC frame length in samples.
const AAC_FRAME_SAMPLES: u32 = 1024;

/// mdat header: size(4) type(4), plus largesize(8) past 4 GiB.
const MDAT_HEADER_LEN: u64 = 8;
const MDAT_LARGE_HEADER_LEN: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct Sample {
    /// Offset inside the mdat payload.
    offset: u64,
    size: u32,
    /// Decode and presentation time in track timescale units.
    dts: i64,
    pts: i64,
    is_sync: bool,
}

#[derive(Debug)]
struct Mp4Track {
    descriptor: StreamDescriptor,
    config: MediaConfig,
    samples: Vec<Sample>,
    sets: nal::ParameterSets,
    /// AudioSpecificConfig from the encoder, when it sent one.
    asc: Option<Vec<u8>>,
}

impl Mp4Track {
    fn timescale(&self) -> u32 {
        match &self.config {
            MediaConfig::Video(_) => VIDEO_TIMESCALE,
            MediaConfig::Audio(audio) => audio.sample_rate,
        }
    }

    /// Duration assumed for the last sample, or a lone sample.
    fn default_duration(&self) -> u32 {
        match &self.config {
            MediaConfig::Video(video) => VIDEO_TIMESCALE / video.fps.max(1),
            MediaConfig::Audio(_) => AAC_FRAME_SAMPLES,
        }
    }

    fn to_timescale(&self, us: i64) -> i64 {
        (us as i128 * self.timescale() as i128 / 1_000_000) as i64
    }

    /// Per-sample durations from dts deltas; the last one repeats its
    /// predecessor.
    fn durations(&self) -> Vec<u32> {
        let mut durations: Vec<u32> = self
            .samples
            .windows(2)
            .map(|pair| (pair[1].dts - pair[0].dts).clamp(0, u32::MAX as i64) as u32)
            .collect();
        if !self.samples.is_empty() {
            let last = durations.last().copied().unwrap_or_else(|| self.default_duration());
            durations.push(last);
        }
        durations
    }

    fn duration(&self) -> u64 {
        self.durations().iter().map(|&d| d as u64).sum()
    }

    fn composition_offsets(&self) -> Option<Vec<u32>> {
        if self.samples.iter().all(|s| s.pts == s.dts) {
            return None;
        }
        Some(
            self.samples
                .iter()
                .map(|s| (s.pts - s.dts).clamp(0, u32::MAX as i64) as u32)
                .collect(),
        )
    }

    /// Sample bytes as stored in `mdat`: length-prefixed NAL units for video,
    /// raw access units for AAC.
    fn sample_data(&mut self, frame: &Frame) -> Vec<u8> {
        let mime_type = self.descriptor.mime_type;
        match self.config {
            MediaConfig::Video(_) => {
                let mut buffers: Vec<&[u8]> = Vec::new();
                if let Some(extra) = &frame.extra {
                    buffers.extend(extra.iter().map(|b| b.as_ref()));
                }
                if frame.is_key_frame {
                    buffers.push(&frame.payload);
                }
                let found = nal::ParameterSets::collect(buffers, mime_type);
                if self.sets.sps.is_empty() && !found.is_empty() {
                    self.sets = found;
                }
                nal::annexb_to_length_prefixed(&frame.payload, mime_type)
            }
            MediaConfig::Audio(_) => {
                if let Some(asc) = frame.extra.as_ref().and_then(|extra| extra.first()) {
                    if self.asc.is_none() && !asc.is_empty() {
                        self.asc = Some(asc.to_vec());
                    }
                }
                let header_len = adts::adts_header_len(&frame.payload);
                frame.payload.get(header_len..).unwrap_or_default().to_vec()
            }
        }
    }

    fn write_trak(
        &self,
        buf: &mut BytesMut,
        creation_time: u32,
        chunk_base: u64,
    ) -> Result<(), MuxError> {
        let track_id = self.descriptor.stream_id as u32;
        let durations = self.durations();
        let media_duration = self.duration();
        let duration_ms = movie_duration(media_duration, self.timescale());
        let (width, height) = match &self.config {
            MediaConfig::Video(video) => (video.resolution.width, video.resolution.height),
            MediaConfig::Audio(_) => (0, 0),
        };
        let asc = match (&self.config, &self.asc) {
            (MediaConfig::Audio(_), Some(asc)) => asc.clone(),
            (MediaConfig::Audio(audio), None) => adts::audio_specific_config(audio)?.to_vec(),
            (MediaConfig::Video(_), _) => Vec::new(),
        };

        write_box(buf, b"trak", |buf| {
            write_tkhd(buf, creation_time, track_id, duration_ms, width, height);
            write_box(buf, b"mdia", |buf| {
                write_mdhd(
                    buf,
                    creation_time,
                    self.timescale(),
                    media_duration.min(u32::MAX as u64) as u32,
                );
                match &self.config {
                    MediaConfig::Video(video) => {
                        write_hdlr(buf, b"vide");
                        write_box(buf, b"minf", |buf| {
                            write_vmhd(buf);
                            write_dinf(buf);
                            self.write_stbl(buf, &durations, chunk_base, |buf| {
                                write_video_stsd(buf, video, &self.sets)
                            });
                        });
                    }
                    MediaConfig::Audio(audio) => {
                        write_hdlr(buf, b"soun");
                        write_box(buf, b"minf", |buf| {
                            write_smhd(buf);
                            write_dinf(buf);
                            self.write_stbl(buf, &durations, chunk_base, |buf| {
                                write_aac_stsd(buf, audio, &asc, self.descriptor.stream_id)
                            });
                        });
                    }
                }
            });
        });
        Ok(())
    }

    fn write_stbl(
        &self,
        buf: &mut BytesMut,
        durations: &[u32],
        chunk_base: u64,
        stsd: impl FnOnce(&mut BytesMut),
    ) {
        let sizes: Vec<u32> = self.samples.iter().map(|s| s.size).collect();
        let offsets: Vec<u64> = self.samples.iter().map(|s| chunk_base + s.offset).collect();
        write_box(buf, b"stbl", |buf| {
            stsd(buf);
            write_stts(buf, durations);
            if let Some(offsets) = self.composition_offsets() {
                write_ctts(buf, &offsets);
            }
            if self.descriptor.mime_type.is_video() {
                let sync: Vec<bool> = self.samples.iter().map(|s| s.is_sync).collect();
                write_stss(buf, &sync);
            }
            write_stsc(buf, self.samples.len());
            SampleSizeBox::new(&sizes).write(buf);
            write_chunk_offsets(buf, &offsets);
        });
    }
}

fn write_video_stsd(buf: &mut BytesMut, config: &VideoConfig, sets: &nal::ParameterSets) {
    if sets.sps.is_empty() {
        log::warn!("mp4 video track has no SPS; avcC carries configured profile only");
    }
    write_avc_stsd(buf, config, sets);
}

/// Track duration rescaled to [`MOVIE_TIMESCALE`].
fn movie_duration(duration: u64, timescale: u32) -> u32 {
    let scaled = duration * MOVIE_TIMESCALE as u64 / timescale.max(1) as u64;
    scaled.min(u32::MAX as u64) as u32
}

/// Whether the MP4 muxer can carry `mime_type`.
pub fn supports(mime_type: MimeType) -> bool {
    matches!(mime_type, MimeType::Avc | MimeType::Aac)
}

/// Counters since the last `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mp4MuxStats {
    pub samples: u64,
    pub mdat_bytes: u64,
}

pub struct Mp4Muxer {
    output: MuxerOutput,
    service: Option<ServiceInfo>,
    tracks: Vec<Mp4Track>,
    mdat: BytesMut,
    creation_time: u32,
    stats: Mp4MuxStats,
}

impl Mp4Muxer {
    pub fn new(output: MuxerOutput) -> Self {
        Self {
            output,
            service: None,
            tracks: Vec::new(),
            mdat: BytesMut::new(),
            creation_time: 0,
            stats: Mp4MuxStats::default(),
        }
    }

    pub fn stats(&self) -> Mp4MuxStats {
        self.stats
    }

    /// The complete file for everything buffered so far.
    fn finish(&self) -> Result<Bytes, MuxError> {
        let mut out = BytesMut::with_capacity(self.mdat.len() + 4096);
        write_ftyp(&mut out);

        let mdat_len = self.mdat.len() as u64;
        let large = mdat_len + MDAT_HEADER_LEN > u32::MAX as u64;
        let header_len = if large { MDAT_LARGE_HEADER_LEN } else { MDAT_HEADER_LEN };
        let chunk_base = out.len() as u64 + header_len;
        if large {
            out.put_u32(1);
            out.put_slice(b"mdat");
            out.put_u64(mdat_len + header_len);
        } else {
            out.put_u32((mdat_len + header_len) as u32);
            out.put_slice(b"mdat");
        }
        out.put_slice(&self.mdat);

        // A declared stream that never got a sample has nothing to describe.
        let tracks: Vec<&Mp4Track> = self
            .tracks
            .iter()
            .filter(|track| {
                let empty = track.samples.is_empty();
                if empty {
                    log::debug!(
                        "mp4 track {} ({}) has no samples; left out",
                        track.descriptor.stream_id,
                        track.descriptor.mime_type
                    );
                }
                !empty
            })
            .collect();

        let duration_ms = tracks
            .iter()
            .map(|track| movie_duration(track.duration(), track.timescale()))
            .max()
            .unwrap_or(0);
        let next_track_id = self
            .tracks
            .last()
            .map_or(FIRST_TRACK_ID, |t| t.descriptor.stream_id + 1);

        let mut moov = BytesMut::new();
        let mut result = Ok(());
        write_box(&mut moov, b"moov", |buf| {
            write_mvhd(buf, self.creation_time, duration_ms, next_track_id as u32);
            for track in &tracks {
                if let Err(e) = track.write_trak(buf, self.creation_time, chunk_base) {
                    result = Err(e);
                    return;
                }
            }
        });
        result?;
        out.put_slice(&moov);
        Ok(out.freeze())
    }

    fn reset(&mut self) {
        self.service = None;
        self.tracks.clear();
        self.mdat = BytesMut::new();
        self.creation_time = 0;
        self.stats = Mp4MuxStats::default();
    }
}

fn mp4_creation_time() -> u32 {
    let unix = chrono::Utc::now().timestamp().max(0) as u64;
    (unix + MP4_EPOCH_OFFSET).min(u32::MAX as u64) as u32
}

impl Muxer for Mp4Muxer {
    fn container(&self) -> ContainerFormat {
        ContainerFormat::Mp4
    }

    fn add_service(&mut self, service: ServiceInfo) -> Result<(), MuxError> {
        if let Some(existing) = &self.service {
            return Err(MuxError::ServiceAlreadyRegistered(existing.id));
        }
        log::debug!("mp4 service 0x{:04x} \"{}\" registered", service.id, service.name);
        self.service = Some(service);
        self.creation_time = mp4_creation_time();
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
        if let Some(config) = configs.iter().find(|c| !supports(c.mime_type())) {
            return Err(MuxError::UnsupportedMimeType {
                container: ContainerFormat::Mp4.name(),
                mime_type: config.mime_type().to_string(),
            });
        }

        let mut next_id = self
            .tracks
            .last()
            .map_or(FIRST_TRACK_ID, |t| t.descriptor.stream_id + 1);
        let mut added = Vec::with_capacity(configs.len());
        for config in configs {
            let descriptor = StreamDescriptor {
                mime_type: config.mime_type(),
                stream_id: next_id,
            };
            next_id += 1;
            log::debug!("mp4 track {} for {}", descriptor.stream_id, descriptor.mime_type);
            self.tracks.push(Mp4Track {
                descriptor,
                config: config.clone(),
                samples: Vec::new(),
                sets: nal::ParameterSets::default(),
                asc: None,
            });
            added.push(descriptor);
        }
        Ok(added)
    }

    fn streams(&self) -> Vec<StreamDescriptor> {
        self.tracks.iter().map(|t| t.descriptor).collect()
    }

    fn encode(&mut self, mut frame: Frame, stream_id: u16) -> Result<(), MuxError> {
        if self.service.is_none() {
            return Err(MuxError::MissingService);
        }
        if self.tracks.is_empty() {
            return Err(MuxError::NoStreams);
        }
        frame.validate()?;

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.descriptor.stream_id == stream_id)
            .ok_or(MuxError::UnknownStream(stream_id))?;
        if track.descriptor.mime_type != frame.mime_type {
            return Err(MuxError::InvalidFrame(format!(
                "{} frame sent to {} track {}",
                frame.mime_type, track.descriptor.mime_type, stream_id
            )));
        }
        frame.stream_id = Some(stream_id);

        let data = track.sample_data(&frame);
        if data.is_empty() {
            return Err(MuxError::InvalidFrame(format!(
                "{} frame carries no sample data",
                frame.mime_type
            )));
        }
        let size = u32::try_from(data.len())
            .map_err(|_| MuxError::InvalidFrame(format!("sample of {} bytes", data.len())))?;

        let mut dts = track.to_timescale(frame.decode_time());
        if let Some(previous) = track.samples.last() {
            if dts < previous.dts {
                log::warn!(
                    "mp4 track {}: dts went backwards ({} < {}), clamping",
                    stream_id,
                    dts,
                    previous.dts
                );
                dts = previous.dts;
            }
        }
        let pts = track.to_timescale(frame.pts).max(dts);
        let is_sync = frame.is_key_frame || !frame.mime_type.is_video();

        track.samples.push(Sample {
            offset: self.mdat.len() as u64,
            size,
            dts,
            pts,
            is_sync,
        });
        self.mdat.put_slice(&data);
        self.stats.samples += 1;
        self.stats.mdat_bytes += data.len() as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MuxError> {
        if self.service.is_none() || self.tracks.is_empty() {
            self.reset();
            return Ok(());
        }
        let result = self.finish();
        let stats = self.stats;
        self.reset();
        let file = result?;
        log::debug!(
            "mp4 muxer stopped: {} samples, {} byte file",
            stats.samples,
            file.len()
        );
        (self.output)(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::models::config::{AudioConfig, VideoConfig};

    fn capture() -> (MuxerOutput, Arc<Mutex<Vec<Bytes>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let output: MuxerOutput = Arc::new(move |bytes: Bytes| sink.lock().push(bytes));
        (output, chunks)
    }

    fn declared() -> (Mp4Muxer, Arc<Mutex<Vec<Bytes>>>) {
        let (output, chunks) = capture();
        let mut muxer = Mp4Muxer::new(output);
        let service = ServiceInfo::default();
        muxer.add_service(service.clone()).unwrap();
        muxer
            .add_streams(
                &service,
                &[
                    MediaConfig::Video(VideoConfig::default()),
                    MediaConfig::Audio(AudioConfig::default()),
                ],
            )
            .unwrap();
        (muxer, chunks)
    }

    fn u32_at(buf: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    /// Top-level boxes as (type, offset, size).
    fn top_level(file: &[u8]) -> Vec<([u8; 4], usize, usize)> {
        let mut boxes = Vec::new();
        let mut pos = 0;
        while pos + 8 <= file.len() {
            let size = u32_at(file, pos) as usize;
            let box_type: [u8; 4] = file[pos + 4..pos + 8].try_into().unwrap();
            boxes.push((box_type, pos, size));
            pos += size;
        }
        assert_eq!(pos, file.len(), "boxes tile the file");
        boxes
    }

    fn find(buf: &[u8], fourcc: &[u8; 4]) -> Vec<usize> {
        buf.windows(4)
            .enumerate()
            .filter(|(_, w)| *w == fourcc)
            .map(|(i, _)| i - 4)
            .collect()
    }

    fn key_frame(pts: i64) -> Frame {
        let mut payload = Vec::new();
        for nal in [&[0x67u8, 0x64, 0x00, 0x1F][..], &[0x68, 0xEE], &[0x65, 0x88, 0x84, 0x21]] {
            payload.extend_from_slice(&nal::START_CODE);
            payload.extend_from_slice(nal);
        }
        Frame::new(payload, pts, MimeType::Avc).key_frame()
    }

    fn delta_frame(pts: i64) -> Frame {
        let mut payload = nal::START_CODE.to_vec();
        payload.extend_from_slice(&[0x41, 0x9A, 0x02]);
        Frame::new(payload, pts, MimeType::Avc)
    }

    #[test]
    fn writes_ftyp_mdat_moov_once_on_stop() {
        let (mut muxer, chunks) = declared();
        muxer.encode(key_frame(0), 1).unwrap();
        muxer.encode(Frame::new(vec![0x21; 200], 0, MimeType::Aac), 2).unwrap();
        muxer.encode(delta_frame(33_333), 1).unwrap();
        assert!(chunks.lock().is_empty(), "nothing is written before stop");

        muxer.stop().unwrap();
        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 1);

        let boxes = top_level(&chunks[0]);
        let types: Vec<&[u8; 4]> = boxes.iter().map(|(t, _, _)| t).collect();
        assert_eq!(types, vec![b"ftyp", b"mdat", b"moov"]);
        assert_eq!(find(&chunks[0], b"trak").len(), 2);
    }

    #[test]
    fn chunk_offsets_point_at_samples() {
        let (mut muxer, chunks) = declared();
        muxer.encode(key_frame(0), 1).unwrap();
        muxer.encode(delta_frame(33_333), 1).unwrap();
        muxer.stop().unwrap();

        let file = chunks.lock()[0].clone();
        let stco = find(&file, b"stco")[0];
        assert_eq!(u32_at(&file, stco + 12), 2);
        let first = u32_at(&file, stco + 16) as usize;
        let second = u32_at(&file, stco + 20) as usize;

        // parameter sets moved to avcC, leaving one length-prefixed IDR
        assert_eq!(&file[first..first + 8], &[0, 0, 0, 4, 0x65, 0x88, 0x84, 0x21]);
        assert_eq!(&file[second..second + 7], &[0, 0, 0, 3, 0x41, 0x9A, 0x02]);
        assert_eq!(find(&file, b"avcC").len(), 1);
    }

    #[test]
    fn sample_tables_describe_video_track() {
        let (mut muxer, chunks) = declared();
        muxer.encode(key_frame(0), 1).unwrap();
        muxer.encode(delta_frame(100_000), 1).unwrap();
        muxer.encode(delta_frame(200_000), 1).unwrap();
        muxer.stop().unwrap();

        let file = chunks.lock()[0].clone();
        let stts = find(&file, b"stts")[0];
        assert_eq!(u32_at(&file, stts + 12), 1, "uniform durations");
        assert_eq!(u32_at(&file, stts + 16), 3);
        assert_eq!(u32_at(&file, stts + 20), 9000);

        let stss = find(&file, b"stss")[0];
        assert_eq!(u32_at(&file, stss + 12), 1);
        assert_eq!(u32_at(&file, stss + 16), 1);

        let stsz = find(&file, b"stsz")[0];
        assert_eq!(u32_at(&file, stsz + 12), 0);
        assert_eq!(u32_at(&file, stsz + 16), 3);
        assert_eq!(u32_at(&file, stsz + 20), 8);
        assert!(find(&file, b"ctts").is_empty());
    }

    #[test]
    fn reordered_frames_get_ctts() {
        let (mut muxer, chunks) = declared();
        muxer.encode(key_frame(66_666).with_dts(0), 1).unwrap();
        muxer.encode(delta_frame(33_333), 1).unwrap();
        muxer.stop().unwrap();

        let file = chunks.lock()[0].clone();
        assert_eq!(find(&file, b"ctts").len(), 1);
    }

    #[test]
    fn adts_headers_are_stripped() {
        let (mut muxer, chunks) = declared();
        let config = AudioConfig::default();
        let raw = vec![0x21u8; 100];
        let mut with_adts = adts::adts_header(&config, raw.len()).unwrap().to_vec();
        with_adts.extend_from_slice(&raw);
        muxer.encode(Frame::new(with_adts, 0, MimeType::Aac), 2).unwrap();
        muxer.stop().unwrap();

        let file = chunks.lock()[0].clone();
        let soun = find(&file, b"soun")[0];
        let stsz = find(&file, b"stsz")
            .into_iter()
            .find(|&offset| offset > soun)
            .unwrap();
        assert_eq!(u32_at(&file, stsz + 12), 100);
        let esds = find(&file, b"esds")[0];
        assert!(file[esds..].windows(3).any(|w| w == [0x05, 0x02, 0x11]));
    }

    #[test]
    fn tracks_without_samples_are_left_out() {
        let (mut muxer, chunks) = declared();
        muxer.encode(Frame::new(vec![0x21; 64], 0, MimeType::Aac), 2).unwrap();
        muxer.stop().unwrap();

        let file = chunks.lock()[0].clone();
        assert_eq!(find(&file, b"trak").len(), 1);
        assert!(find(&file, b"avcC").is_empty());
        assert_eq!(find(&file, b"mp4a").len(), 1);
        let tkhd = find(&file, b"tkhd")[0];
        // version 0: size, type, flags, creation, modification, track_ID
        assert_eq!(u32_at(&file, tkhd + 20), 2);
    }

    #[test]
    fn unsupported_codecs_rejected_at_declaration() {
        let (output, _) = capture();
        let mut muxer = Mp4Muxer::new(output);
        let service = ServiceInfo::default();
        muxer.add_service(service.clone()).unwrap();

        let err = muxer
            .add_streams(&service, &[MediaConfig::Video(VideoConfig::for_mime_type(MimeType::Hevc))])
            .unwrap_err();
        assert_eq!(
            err,
            MuxError::UnsupportedMimeType {
                container: "mp4",
                mime_type: "video/hevc".into()
            }
        );
        assert!(muxer.streams().is_empty());
    }

    #[test]
    fn track_ids_start_at_one() {
        let (muxer, _) = declared();
        assert_eq!(muxer.stream_id(MimeType::Avc), Some(1));
        assert_eq!(muxer.stream_id(MimeType::Aac), Some(2));
    }

    #[test]
    fn stop_without_streams_writes_nothing() {
        let (output, chunks) = capture();
        let mut muxer = Mp4Muxer::new(output);
        muxer.stop().unwrap();
        assert!(chunks.lock().is_empty());
    }

    #[test]
    fn stop_resets_for_next_session() {
        let (mut muxer, _) = declared();
        muxer.encode(key_frame(0), 1).unwrap();
        muxer.stop().unwrap();

        assert!(muxer.streams().is_empty());
        assert_eq!(muxer.stats(), Mp4MuxStats::default());
        assert_eq!(muxer.encode(key_frame(0), 1), Err(MuxError::MissingService));
    }
}
