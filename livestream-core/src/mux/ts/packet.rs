//! Transport stream packets: headers, adaptation fields, PES headers.

use bytes::{BufMut, BytesMut};

use crate::models::error::MuxError;

/// Size of a single MPEG-TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte for TS packets.
pub const SYNC_BYTE: u8 = 0x47;

/// Payload bytes in a packet without adaptation field.
const MAX_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

/// Adaptation field carrying a PCR: length, flags, 6 PCR bytes.
const PCR_ADAPTATION_LEN: usize = 8;

const TIMESTAMP_WRAP: i64 = 1 << 33;

/// 4-bit per-PID packet counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuityCounter(u8);

impl ContinuityCounter {
    /// Current value; advances the counter by one (mod 16).
    pub fn next(&mut self) -> u8 {
        let value = self.0;
        self.0 = (self.0 + 1) & 0x0F;
        value
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Microseconds to the 33-bit 90 kHz clock, wrapping negatives.
pub fn to_90khz(us: i64) -> u64 {
    (us.saturating_mul(9).div_euclid(100)).rem_euclid(TIMESTAMP_WRAP) as u64
}

/// Encode a 33-bit timestamp for a PES header.
///
/// Format: marker(4) + ts[32:30](3) + 1 + ts[29:15](15) + 1 + ts[14:0](15) + 1
pub fn encode_timestamp(ts: u64, marker: u8) -> [u8; 5] {
    [
        (marker << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 0x01,
        ((ts >> 22) & 0xFF) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 0x01,
        ((ts >> 7) & 0xFF) as u8,
        (((ts & 0x7F) as u8) << 1) | 0x01,
    ]
}

/// Encode a 27 MHz program clock reference (33-bit base, 9-bit extension).
pub fn encode_pcr(pcr: u64) -> [u8; 6] {
    let base = (pcr / 300) & 0x1_FFFF_FFFF;
    let ext = (pcr % 300) as u16;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 0x01) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 0x01),
        ext as u8,
    ]
}

/// PES header for one access unit. `pts`/`dts` are on the 90 kHz clock.
///
/// `bounded` writes the real packet length when it fits in 16 bits; video
/// streams pass `false` and get the unbounded length 0.
pub fn pes_header(
    stream_id: u8,
    payload_len: usize,
    pts: u64,
    dts: Option<u64>,
    bounded: bool,
) -> Vec<u8> {
    let header_data_len = if dts.is_some() { 10 } else { 5 };
    let mut pes = Vec::with_capacity(9 + header_data_len);

    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    let packet_len = 3 + header_data_len + payload_len;
    let packet_len = if bounded && packet_len <= u16::MAX as usize {
        packet_len as u16
    } else {
        0
    };
    pes.extend_from_slice(&packet_len.to_be_bytes());

    pes.push(0x84); // '10', data_alignment_indicator
    match dts {
        Some(dts) => {
            pes.push(0xC0);
            pes.push(header_data_len as u8);
            pes.extend_from_slice(&encode_timestamp(pts, 0x03));
            pes.extend_from_slice(&encode_timestamp(dts, 0x01));
        }
        None => {
            pes.push(0x80);
            pes.push(header_data_len as u8);
            pes.extend_from_slice(&encode_timestamp(pts, 0x02));
        }
    }
    pes
}

/// Split `data` into 188-byte packets on `pid`.
///
/// The first packet sets payload_unit_start and carries `pcr` (27 MHz) when
/// given. The last packet is padded with adaptation-field stuffing so every
/// packet is full size.
pub fn packetize(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut ContinuityCounter,
    data: &[u8],
    pcr: Option<u64>,
) -> usize {
    let mut offset = 0;
    let mut packets = 0;

    loop {
        let first = offset == 0;
        let pcr = pcr.filter(|_| first);
        let remaining = data.len() - offset;

        let min_adaptation = if pcr.is_some() { PCR_ADAPTATION_LEN } else { 0 };
        let space = MAX_PAYLOAD_SIZE - min_adaptation;
        let (adaptation_len, payload_len) = if remaining >= space {
            (min_adaptation, space)
        } else {
            (MAX_PAYLOAD_SIZE - remaining, remaining)
        };

        let start = out.len();
        out.put_u8(SYNC_BYTE);
        out.put_u16((if first { 0x4000 } else { 0 }) | (pid & 0x1FFF));
        let control = if adaptation_len > 0 { 0x30 } else { 0x10 };
        out.put_u8(control | cc.next());

        match adaptation_len {
            0 => {}
            1 => out.put_u8(0),
            len => {
                out.put_u8((len - 1) as u8);
                let mut used = 2;
                match pcr {
                    Some(pcr) => {
                        out.put_u8(0x10);
                        out.put_slice(&encode_pcr(pcr));
                        used += 6;
                    }
                    None => out.put_u8(0x00),
                }
                out.put_bytes(0xFF, len - used);
            }
        }

        out.put_slice(&data[offset..offset + payload_len]);
        debug_assert_eq!(out.len() - start, TS_PACKET_SIZE);

        offset += payload_len;
        packets += 1;
        if offset >= data.len() {
            return packets;
        }
    }
}

/// Whether `section` plus its pointer field fits one packet payload.
pub fn section_fits(section: &[u8]) -> bool {
    section.len() + 1 <= MAX_PAYLOAD_SIZE
}

/// Write one PSI section into a single packet on `pid`.
pub fn write_section(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut ContinuityCounter,
    section: &[u8],
    name: &str,
) -> Result<(), MuxError> {
    if !section_fits(section) {
        return Err(MuxError::TableTooLarge(format!(
            "{} section is {} bytes",
            name,
            section.len()
        )));
    }
    out.put_u8(SYNC_BYTE);
    out.put_u16(0x4000 | (pid & 0x1FFF));
    out.put_u8(0x10 | cc.next());
    out.put_u8(0x00);
    out.put_slice(section);
    out.put_bytes(0xFF, MAX_PAYLOAD_SIZE - 1 - section.len());
    Ok(())
}
