//! `stsd` sample entries: `avc1` with its `avcC`, `mp4a` with its `esds`.

use bytes::{BufMut, BytesMut};

use super::boxes::{put_descriptor_length, write_box, write_full_box};
use crate::models::config::{AudioConfig, VideoConfig};
use crate::mux::nal::ParameterSets;

const ES_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_TAG: u8 = 0x04;
const DECODER_SPECIFIC_INFO_TAG: u8 = 0x05;
const SL_CONFIG_TAG: u8 = 0x06;

/// objectTypeIndication for MPEG-4 audio.
const OBJECT_TYPE_AAC: u8 = 0x40;
/// streamType audio (0x05 << 2 | upStream 0 | reserved 1).
const STREAM_TYPE_AUDIO: u8 = 0x15;

/// Video `stsd` with one `avc1` entry.
///
/// Profile and level come from the SPS when one is known, else from the
/// configuration.
pub fn write_avc_stsd(buf: &mut BytesMut, config: &VideoConfig, sets: &ParameterSets) {
    write_full_box(buf, b"stsd", 0, 0, |buf| {
        buf.put_u32(1);
        write_box(buf, b"avc1", |buf| {
            buf.put_bytes(0, 6);
            buf.put_u16(1); // data_reference_index
            buf.put_bytes(0, 16);
            buf.put_u16(config.resolution.width as u16);
            buf.put_u16(config.resolution.height as u16);
            buf.put_u32(0x0048_0000); // 72 dpi
            buf.put_u32(0x0048_0000);
            buf.put_u32(0);
            buf.put_u16(1); // frame_count
            buf.put_bytes(0, 32); // compressorname
            buf.put_u16(0x0018);
            buf.put_i16(-1);
            write_avcc(buf, config, sets);
        });
    });
}

fn write_avcc(buf: &mut BytesMut, config: &VideoConfig, sets: &ParameterSets) {
    let (profile, compatibility, level) = match sets.sps.first() {
        Some(sps) if sps.len() >= 4 => (sps[1], sps[2], sps[3]),
        _ => (config.profile, 0, config.level),
    };
    write_box(buf, b"avcC", |buf| {
        buf.put_u8(1); // configurationVersion
        buf.put_u8(profile);
        buf.put_u8(compatibility);
        buf.put_u8(level);
        buf.put_u8(0xFF); // 4-byte NAL lengths
        buf.put_u8(0xE0 | (sets.sps.len() as u8 & 0x1F));
        for sps in &sets.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(sets.pps.len() as u8);
        for pps in &sets.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }
    });
}

/// Audio `stsd` with one `mp4a` entry. `asc` is the AudioSpecificConfig.
pub fn write_aac_stsd(buf: &mut BytesMut, config: &AudioConfig, asc: &[u8], track_id: u16) {
    write_full_box(buf, b"stsd", 0, 0, |buf| {
        buf.put_u32(1);
        write_box(buf, b"mp4a", |buf| {
            buf.put_bytes(0, 6);
            buf.put_u16(1); // data_reference_index
            buf.put_bytes(0, 8);
            buf.put_u16(config.channel_count as u16);
            buf.put_u16(16); // samplesize
            buf.put_u32(0);
            // 16.16 sample rate; rates above 65535 Hz do not fit and are written as 0
            buf.put_u32(if config.sample_rate <= u16::MAX as u32 {
                config.sample_rate << 16
            } else {
                0
            });
            write_esds(buf, config, asc, track_id);
        });
    });
}

fn write_esds(buf: &mut BytesMut, config: &AudioConfig, asc: &[u8], track_id: u16) {
    write_full_box(buf, b"esds", 0, 0, |buf| {
        let decoder_specific_len = 2 + asc.len();
        let decoder_config_len = 13 + decoder_specific_len;
        let es_len = 3 + 2 + decoder_config_len + 3;

        buf.put_u8(ES_DESCRIPTOR_TAG);
        put_descriptor_length(buf, es_len);
        buf.put_u16(track_id);
        buf.put_u8(0); // no dependency, URL or OCR stream

        buf.put_u8(DECODER_CONFIG_TAG);
        put_descriptor_length(buf, decoder_config_len);
        buf.put_u8(OBJECT_TYPE_AAC);
        buf.put_u8(STREAM_TYPE_AUDIO);
        buf.put_bytes(0, 3); // bufferSizeDB
        buf.put_u32(config.start_bitrate); // maxBitrate
        buf.put_u32(config.start_bitrate); // avgBitrate

        buf.put_u8(DECODER_SPECIFIC_INFO_TAG);
        put_descriptor_length(buf, asc.len());
        buf.put_slice(asc);

        buf.put_u8(SL_CONFIG_TAG);
        put_descriptor_length(buf, 1);
        buf.put_u8(0x02); // predefined: MP4
    });
}
