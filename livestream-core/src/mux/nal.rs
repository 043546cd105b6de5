//! NAL unit helpers: Annex-B scanning, parameter-set detection and
//! Annex-B to length-prefixed conversion.

use bytes::Bytes;

use crate::models::media::MimeType;

/// Annex-B start code (4 bytes).
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const AVC_SPS: u8 = 7;
const AVC_PPS: u8 = 8;
const AVC_AUD: u8 = 9;

const HEVC_VPS: u8 = 32;
const HEVC_SPS: u8 = 33;
const HEVC_PPS: u8 = 34;
const HEVC_AUD: u8 = 35;

/// Kind of parameter set carried by a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSet {
    Vps,
    Sps,
    Pps,
}

/// Whether `data` starts with a 3- or 4-byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x01]) || data.starts_with(&START_CODE)
}

/// Split an Annex-B buffer into NAL units (start codes removed).
///
/// Data that does not start with a start code is returned as one unit.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    if !is_annexb(data) {
        return if data.is_empty() { Vec::new() } else { vec![data] };
    }

    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                units.push(trim_trailing_zeros(&data[s..i]));
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            units.push(&data[s..]);
        }
    }
    units.retain(|unit| !unit.is_empty());
    units
}

// The zero before a 4-byte start code belongs to the start code, not the NAL.
fn trim_trailing_zeros(unit: &[u8]) -> &[u8] {
    let end = unit.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &unit[..end]
}

/// Classify a NAL unit as a parameter set for `mime_type`.
pub fn parameter_set(nal: &[u8], mime_type: MimeType) -> Option<ParameterSet> {
    let first = *nal.first()?;
    match mime_type {
        MimeType::Avc => match first & 0x1F {
            AVC_SPS => Some(ParameterSet::Sps),
            AVC_PPS => Some(ParameterSet::Pps),
            _ => None,
        },
        MimeType::Hevc => match (first >> 1) & 0x3F {
            HEVC_VPS => Some(ParameterSet::Vps),
            HEVC_SPS => Some(ParameterSet::Sps),
            HEVC_PPS => Some(ParameterSet::Pps),
            _ => None,
        },
        _ => None,
    }
}

fn is_access_unit_delimiter(nal: &[u8], mime_type: MimeType) -> bool {
    match (nal.first(), mime_type) {
        (Some(b), MimeType::Avc) => b & 0x1F == AVC_AUD,
        (Some(b), MimeType::Hevc) => (b >> 1) & 0x3F == HEVC_AUD,
        _ => false,
    }
}

/// Whether an Annex-B access unit already carries an SPS.
pub fn contains_sps(data: &[u8], mime_type: MimeType) -> bool {
    split_annexb(data)
        .into_iter()
        .any(|nal| parameter_set(nal, mime_type) == Some(ParameterSet::Sps))
}

/// Parameter sets found in codec data buffers, each buffer being either a
/// bare NAL unit or an Annex-B sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl ParameterSets {
    pub fn collect<'a>(buffers: impl IntoIterator<Item = &'a [u8]>, mime_type: MimeType) -> Self {
        let mut sets = Self::default();
        for buffer in buffers {
            for nal in split_annexb(buffer) {
                let list = match parameter_set(nal, mime_type) {
                    Some(ParameterSet::Vps) => &mut sets.vps,
                    Some(ParameterSet::Sps) => &mut sets.sps,
                    Some(ParameterSet::Pps) => &mut sets.pps,
                    None => continue,
                };
                if !list.iter().any(|known| known.as_ref() == nal) {
                    list.push(Bytes::copy_from_slice(nal));
                }
            }
        }
        sets
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty()
    }

    /// All sets as one Annex-B buffer (VPS, SPS, PPS order).
    pub fn to_annexb(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in self.vps.iter().chain(&self.sps).chain(&self.pps) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }
}

/// Convert an Annex-B access unit to 4-byte length-prefixed NAL units,
/// dropping parameter sets and access unit delimiters, which MP4 carries
/// out of band.
///
/// Buffers that are not Annex-B are assumed to be length-prefixed already.
pub fn annexb_to_length_prefixed(data: &[u8], mime_type: MimeType) -> Vec<u8> {
    if !is_annexb(data) {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    for nal in split_annexb(data) {
        if parameter_set(nal, mime_type).is_some() || is_access_unit_delimiter(nal, mime_type) {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}
