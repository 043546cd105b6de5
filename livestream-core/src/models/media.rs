use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::MuxError;

/// Media kind of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codec mime types understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MimeType {
    #[serde(rename = "video/avc")]
    Avc,
    #[serde(rename = "video/hevc")]
    Hevc,
    #[serde(rename = "audio/mp4a-latm")]
    Aac,
    #[serde(rename = "audio/opus")]
    Opus,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avc => "video/avc",
            Self::Hevc => "video/hevc",
            Self::Aac => "audio/mp4a-latm",
            Self::Opus => "audio/opus",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Avc | Self::Hevc => MediaKind::Video,
            Self::Aac | Self::Opus => MediaKind::Audio,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind() == MediaKind::Audio
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video/avc" => Ok(Self::Avc),
            "video/hevc" => Ok(Self::Hevc),
            "audio/mp4a-latm" | "audio/aac" => Ok(Self::Aac),
            "audio/opus" => Ok(Self::Opus),
            other => Err(format!("unsupported mime type: {other}")),
        }
    }
}

/// Frame width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One unit of raw or encoded media.
///
/// Timestamps are in microseconds. `dts` is only set when it differs from
/// `pts` (reordering codecs). `stream_id` is stamped by the muxer when the
/// frame is packetized; encoders leave it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub pts: i64,
    pub dts: Option<i64>,
    pub is_key_frame: bool,
    pub mime_type: MimeType,
    /// Codec-specific data (SPS/PPS, AudioSpecificConfig), when the encoder
    /// delivers it out of band.
    pub extra: Option<Vec<Bytes>>,
    pub stream_id: Option<u16>,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, pts: i64, mime_type: MimeType) -> Self {
        Self {
            payload: payload.into(),
            pts,
            dts: None,
            is_key_frame: false,
            mime_type,
            extra: None,
            stream_id: None,
        }
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = (dts != self.pts).then_some(dts);
        self
    }

    pub fn key_frame(mut self) -> Self {
        self.is_key_frame = true;
        self
    }

    pub fn with_extra(mut self, extra: Vec<Bytes>) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Decode timestamp, falling back to `pts`.
    pub fn decode_time(&self) -> i64 {
        self.dts.unwrap_or(self.pts)
    }

    pub fn validate(&self) -> Result<(), MuxError> {
        if self.payload.is_empty() {
            return Err(MuxError::InvalidFrame("empty payload".into()));
        }
        if let Some(dts) = self.dts {
            if dts > self.pts {
                return Err(MuxError::InvalidFrame(format!(
                    "dts {} is after pts {}",
                    dts, self.pts
                )));
            }
        }
        Ok(())
    }
}

/// Mapping of a declared stream to its muxer-assigned identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub mime_type: MimeType,
    pub stream_id: u16,
}

/// DVB service type carried in the service description table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    DigitalTv,
    DigitalRadio,
    AdvancedCodecHdDigitalTv,
}

impl ServiceType {
    pub fn code(&self) -> u8 {
        match self {
            Self::DigitalTv => 0x01,
            Self::DigitalRadio => 0x02,
            Self::AdvancedCodecHdDigitalTv => 0x19,
        }
    }
}

/// The one program carried by a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_type: ServiceType,
    pub id: u16,
    pub name: String,
    pub provider_name: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service_type: ServiceType::DigitalTv,
            id: 0x4698,
            name: "livestream".into(),
            provider_name: "livestream".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_round_trips_through_str() {
        for mime in [MimeType::Avc, MimeType::Hevc, MimeType::Aac, MimeType::Opus] {
            assert_eq!(mime.as_str().parse::<MimeType>().unwrap(), mime);
        }
        assert!("video/vp9".parse::<MimeType>().is_err());
    }

    #[test]
    fn dts_equal_to_pts_is_dropped() {
        let frame = Frame::new(vec![1u8], 1000, MimeType::Avc).with_dts(1000);
        assert_eq!(frame.dts, None);

        let frame = Frame::new(vec![1u8], 1000, MimeType::Avc).with_dts(966);
        assert_eq!(frame.dts, Some(966));
        assert_eq!(frame.decode_time(), 966);
    }

    #[test]
    fn validate_rejects_dts_after_pts() {
        let frame = Frame::new(vec![1u8], 1000, MimeType::Avc).with_dts(2000);
        assert!(matches!(frame.validate(), Err(MuxError::InvalidFrame(_))));
    }

    #[test]
    fn validate_rejects_empty_payload() {
        let frame = Frame::new(Vec::<u8>::new(), 0, MimeType::Aac);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn mime_serializes_as_mime_string() {
        let json = serde_json::to_string(&MimeType::Aac).unwrap();
        assert_eq!(json, "\"audio/mp4a-latm\"");
    }
}
