use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::ContainerFormat;
use super::media::MimeType;

/// Per-stream totals of a finished streaming run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub stream_id: u16,
    pub mime_type: MimeType,
    pub frames: u64,
}

/// Summary returned when a streaming run stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub container: ContainerFormat,
    pub streams: Vec<StreamSummary>,

    /// Muxed bytes handed to the sink.
    pub bytes_written: u64,

    /// Output chunks discarded because the sink fell behind.
    pub dropped_chunks: u64,

    /// Frames discarded after the frame gate closed or the muxer refused them.
    pub dropped_frames: u64,
}

impl StreamReport {
    pub fn frames_for(&self, mime_type: MimeType) -> u64 {
        self.streams
            .iter()
            .filter(|s| s.mime_type == mime_type)
            .map(|s| s.frames)
            .sum()
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
