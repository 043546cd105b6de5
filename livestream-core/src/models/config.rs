use serde::{Deserialize, Serialize};

use super::error::StreamError;
use super::media::{MediaKind, MimeType, Resolution, ServiceInfo};
use crate::mux::ts::{packet, psi};

/// Sampling rates addressable by an AAC sampling-frequency index.
pub const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// AAC low-complexity audio object type.
pub const AAC_PROFILE_LC: u8 = 2;

/// PCM layout delivered by the audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    S16,
    Float,
}

/// Audio encoder and capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub mime_type: MimeType,

    /// Encoder bitrate in bits/s (default: 128000).
    pub start_bitrate: u32,

    /// Sample rate in Hz (default: 48000).
    pub sample_rate: u32,

    /// 1 = mono, 2 = stereo (default: 2).
    pub channel_count: u8,

    /// AAC audio object type (default: 2, low complexity). Ignored for Opus.
    pub profile: u8,

    pub sample_format: SampleFormat,
}

impl AudioConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.mime_type.is_audio() {
            return Err(StreamError::Configuration(format!(
                "audio config needs an audio mime type, got {}",
                self.mime_type
            )));
        }
        if self.start_bitrate == 0 {
            return Err(StreamError::Configuration("audio bitrate must be positive".into()));
        }
        if !(1..=2).contains(&self.channel_count) {
            return Err(StreamError::Configuration(format!(
                "unsupported channel count: {}",
                self.channel_count
            )));
        }
        let rates: &[u32] = match self.mime_type {
            MimeType::Opus => &OPUS_SAMPLE_RATES,
            _ => &AAC_SAMPLE_RATES,
        };
        if !rates.contains(&self.sample_rate) {
            return Err(StreamError::Configuration(format!(
                "unsupported sample rate for {}: {}",
                self.mime_type, self.sample_rate
            )));
        }
        if self.mime_type == MimeType::Aac && !(1..=4).contains(&self.profile) {
            return Err(StreamError::Configuration(format!(
                "unsupported AAC profile: {}",
                self.profile
            )));
        }
        Ok(())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mime_type: MimeType::Aac,
            start_bitrate: 128_000,
            sample_rate: 48000,
            channel_count: 2,
            profile: AAC_PROFILE_LC,
            sample_format: SampleFormat::S16,
        }
    }
}

/// Video encoder and capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    pub mime_type: MimeType,

    /// Encoder bitrate in bits/s (default: 2 Mb/s).
    pub start_bitrate: u32,

    pub resolution: Resolution,

    /// Best effort: cameras do not always hold a fixed rate.
    pub fps: u32,

    /// Codec profile (`profile_idc` for AVC, `general_profile_idc` for HEVC).
    /// Encoders fall back to their default when unsupported.
    pub profile: u8,

    /// Codec level (`level_idc`, e.g. 52 for AVC level 5.2).
    pub level: u8,
}

impl VideoConfig {
    /// A config for `mime_type` with that codec's default profile and level.
    pub fn for_mime_type(mime_type: MimeType) -> Self {
        let (profile, level) = match mime_type {
            MimeType::Hevc => (1, 186),
            _ => (100, 52),
        };
        Self {
            mime_type,
            profile,
            level,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.mime_type.is_video() {
            return Err(StreamError::Configuration(format!(
                "video config needs a video mime type, got {}",
                self.mime_type
            )));
        }
        if self.start_bitrate == 0 {
            return Err(StreamError::Configuration("video bitrate must be positive".into()));
        }
        let Resolution { width, height } = self.resolution;
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(StreamError::Configuration(format!(
                "unsupported resolution: {}x{}",
                width, height
            )));
        }
        if !(1..=120).contains(&self.fps) {
            return Err(StreamError::Configuration(format!("unsupported fps: {}", self.fps)));
        }
        Ok(())
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            mime_type: MimeType::Avc,
            start_bitrate: 2_000_000,
            resolution: Resolution::new(1280, 720),
            fps: 30,
            profile: 100,
            level: 52,
        }
    }
}

/// Either half of a session configuration, as handed to encoders and muxers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaConfig {
    Audio(AudioConfig),
    Video(VideoConfig),
}

impl MediaConfig {
    pub fn mime_type(&self) -> MimeType {
        match self {
            Self::Audio(config) => config.mime_type,
            Self::Video(config) => config.mime_type,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn start_bitrate(&self) -> u32 {
        match self {
            Self::Audio(config) => config.start_bitrate,
            Self::Video(config) => config.start_bitrate,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioConfig> {
        match self {
            Self::Audio(config) => Some(config),
            Self::Video(_) => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoConfig> {
        match self {
            Self::Video(config) => Some(config),
            Self::Audio(_) => None,
        }
    }
}

/// Container family produced by the muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// MPEG transport stream, suited to live network sinks.
    Ts,
    /// ISO base media file, written in one piece when the stream stops.
    Mp4,
}

impl ContainerFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ts => "mpeg-ts",
            Self::Mp4 => "mp4",
        }
    }
}

/// When the transport stream repeats its program tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableRefreshPolicy {
    /// Emit tables in front of every video key frame.
    pub on_key_frame: bool,

    /// Also emit tables when this much stream time has elapsed since the last
    /// emission. `None` disables the periodic refresh.
    pub interval_ms: Option<u32>,
}

impl Default for TableRefreshPolicy {
    fn default() -> Self {
        Self {
            on_key_frame: true,
            interval_ms: Some(500),
        }
    }
}

/// What the output queue does when the sink falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

/// Session-wide settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub container: ContainerFormat,
    pub service: ServiceInfo,
    pub table_refresh: TableRefreshPolicy,

    /// Bytes of muxed output that may wait for the sink (default: 4 MiB).
    pub output_queue_bytes: usize,

    pub overflow: OverflowPolicy,

    /// Camera used when `start_capture` gets an empty device id.
    pub default_camera_id: String,
}

impl SessionSettings {
    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| StreamError::Configuration(format!("invalid session settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.output_queue_bytes == 0 {
            return Err(StreamError::Configuration(
                "output queue capacity must be positive".into(),
            ));
        }
        if self.service.name.is_empty() {
            return Err(StreamError::Configuration("service name must not be empty".into()));
        }
        if self.service.name.len() > 255 || self.service.provider_name.len() > 255 {
            return Err(StreamError::Configuration(
                "service and provider names are limited to 255 bytes".into(),
            ));
        }
        if self.container == ContainerFormat::Ts {
            let sdt = psi::sdt(&self.service);
            if !packet::section_fits(&sdt) {
                return Err(StreamError::Configuration(format!(
                    "service and provider names too long for one SDT packet ({} byte section)",
                    sdt.len()
                )));
            }
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            container: ContainerFormat::Ts,
            service: ServiceInfo::default(),
            table_refresh: TableRefreshPolicy::default(),
            output_queue_bytes: 4 * 1024 * 1024,
            overflow: OverflowPolicy::DropOldest,
            default_camera_id: "0".into(),
        }
    }
}
