//! AAC framing: ADTS headers for transport streams and the
//! AudioSpecificConfig carried by MP4.

use crate::models::config::{AudioConfig, AAC_SAMPLE_RATES};
use crate::models::error::MuxError;

/// ADTS header without CRC.
pub const ADTS_HEADER_LEN: usize = 7;

const MAX_ADTS_FRAME_LEN: usize = 0x1FFF;

pub fn sampling_frequency_index(sample_rate: u32) -> Option<u8> {
    AAC_SAMPLE_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|index| index as u8)
}

fn frequency_index(config: &AudioConfig) -> Result<u8, MuxError> {
    sampling_frequency_index(config.sample_rate).ok_or_else(|| {
        MuxError::InvalidFrame(format!("no AAC sampling index for {} Hz", config.sample_rate))
    })
}

/// Whether `data` starts with an ADTS sync word.
pub fn has_adts_header(data: &[u8]) -> bool {
    data.len() >= ADTS_HEADER_LEN && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}

/// ADTS header for a raw access unit of `payload_len` bytes.
pub fn adts_header(config: &AudioConfig, payload_len: usize) -> Result<[u8; ADTS_HEADER_LEN], MuxError> {
    let frame_len = payload_len + ADTS_HEADER_LEN;
    if frame_len > MAX_ADTS_FRAME_LEN {
        return Err(MuxError::InvalidFrame(format!(
            "AAC frame of {} bytes does not fit in ADTS",
            payload_len
        )));
    }
    let profile = config.profile.saturating_sub(1) & 0x03;
    let sf_index = frequency_index(config)?;
    let channels = config.channel_count & 0x07;

    Ok([
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        (profile << 6) | (sf_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
        (frame_len >> 3) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC, // buffer fullness 0x7FF, one raw data block
    ])
}

/// Length of the ADTS header at the start of `data`, CRC included.
pub fn adts_header_len(data: &[u8]) -> usize {
    if !has_adts_header(data) {
        return 0;
    }
    let protection_absent = data[1] & 0x01 == 1;
    if protection_absent {
        ADTS_HEADER_LEN
    } else {
        ADTS_HEADER_LEN + 2
    }
}

/// Two-byte AudioSpecificConfig (object type, sampling index, channels).
pub fn audio_specific_config(config: &AudioConfig) -> Result<[u8; 2], MuxError> {
    let object_type = config.profile & 0x1F;
    let sf_index = frequency_index(config)?;
    let channels = config.channel_count & 0x0F;
    Ok([
        (object_type << 3) | (sf_index >> 1),
        ((sf_index & 0x01) << 7) | (channels << 3),
    ])
}
