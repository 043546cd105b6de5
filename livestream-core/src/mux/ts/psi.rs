//! Program-specific information: PAT, PMT and the DVB service description
//! table. Each builder returns one complete section, CRC included.

use crc::{Crc, CRC_32_MPEG_2};

use crate::models::media::{MimeType, ServiceInfo};

const PSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

pub const PAT_PID: u16 = 0x0000;
pub const SDT_PID: u16 = 0x0011;
pub const PMT_PID: u16 = 0x1000;

pub const TRANSPORT_STREAM_ID: u16 = 0x0001;
pub const ORIGINAL_NETWORK_ID: u16 = 0xFF01;

const PAT_TABLE_ID: u8 = 0x00;
const PMT_TABLE_ID: u8 = 0x02;
const SDT_TABLE_ID: u8 = 0x42;

const SERVICE_DESCRIPTOR_TAG: u8 = 0x48;
const REGISTRATION_DESCRIPTOR_TAG: u8 = 0x05;
const EXTENSION_DESCRIPTOR_TAG: u8 = 0x7F;
const OPUS_EXTENSION_TAG: u8 = 0x80;

const RUNNING_STATUS_RUNNING: u8 = 4;

/// ISO/IEC 13818-1 stream type for `mime_type`.
pub fn stream_type(mime_type: MimeType) -> u8 {
    match mime_type {
        MimeType::Avc => 0x1B,
        MimeType::Hevc => 0x24,
        MimeType::Aac => 0x0F,
        // private PES, identified by its registration descriptor
        MimeType::Opus => 0x06,
    }
}

/// One elementary stream row of the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtEntry {
    pub mime_type: MimeType,
    pub pid: u16,
    pub channel_count: u8,
}

impl PmtEntry {
    fn descriptors(&self) -> Vec<u8> {
        match self.mime_type {
            MimeType::Opus => {
                let mut desc = vec![REGISTRATION_DESCRIPTOR_TAG, 4];
                desc.extend_from_slice(b"Opus");
                desc.extend_from_slice(&[EXTENSION_DESCRIPTOR_TAG, 2, OPUS_EXTENSION_TAG]);
                desc.push(self.channel_count);
                desc
            }
            _ => Vec::new(),
        }
    }
}

/// Start a long-form section: table id, length placeholder, id, version.
fn begin_section(table_id: u8, length_flags: u8, table_id_extension: u16) -> Vec<u8> {
    let mut section = vec![table_id, length_flags, 0x00];
    section.extend_from_slice(&table_id_extension.to_be_bytes());
    section.push(0xC1); // version 0, current_next
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section
}

/// Patch section_length (CRC included) and append the CRC.
fn finish_section(mut section: Vec<u8>) -> Vec<u8> {
    let section_length = section.len() - 3 + 4;
    section[1] |= (section_length >> 8) as u8 & 0x0F;
    section[2] = section_length as u8;
    let crc = PSI_CRC.checksum(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// Program association table pointing `program_number` at the PMT PID.
pub fn pat(program_number: u16) -> Vec<u8> {
    let mut section = begin_section(PAT_TABLE_ID, 0xB0, TRANSPORT_STREAM_ID);
    section.extend_from_slice(&program_number.to_be_bytes());
    section.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
    finish_section(section)
}

/// Program map table listing every elementary stream of the program.
pub fn pmt(program_number: u16, pcr_pid: u16, entries: &[PmtEntry]) -> Vec<u8> {
    let mut section = begin_section(PMT_TABLE_ID, 0xB0, program_number);
    section.extend_from_slice(&(0xE000 | (pcr_pid & 0x1FFF)).to_be_bytes());
    section.extend_from_slice(&[0xF0, 0x00]); // no program descriptors

    for entry in entries {
        section.push(stream_type(entry.mime_type));
        section.extend_from_slice(&(0xE000 | (entry.pid & 0x1FFF)).to_be_bytes());
        let descriptors = entry.descriptors();
        section.extend_from_slice(&(0xF000 | (descriptors.len() as u16 & 0x0FFF)).to_be_bytes());
        section.extend_from_slice(&descriptors);
    }
    finish_section(section)
}

/// Service description table naming the service and its provider.
pub fn sdt(service: &ServiceInfo) -> Vec<u8> {
    let mut section = begin_section(SDT_TABLE_ID, 0xF0, TRANSPORT_STREAM_ID);
    section.extend_from_slice(&ORIGINAL_NETWORK_ID.to_be_bytes());
    section.push(0xFF); // reserved_future_use

    let provider = service.provider_name.as_bytes();
    let name = service.name.as_bytes();
    let mut descriptor = vec![SERVICE_DESCRIPTOR_TAG, 0, service.service_type.code()];
    descriptor.push(provider.len() as u8);
    descriptor.extend_from_slice(provider);
    descriptor.push(name.len() as u8);
    descriptor.extend_from_slice(name);
    descriptor[1] = (descriptor.len() - 2) as u8;

    section.extend_from_slice(&service.id.to_be_bytes());
    section.push(0xFC); // no EIT schedule, no EIT present/following
    let loop_length = descriptor.len() as u16 & 0x0FFF;
    section.extend_from_slice(&(((RUNNING_STATUS_RUNNING as u16) << 13) | loop_length).to_be_bytes());
    section.extend_from_slice(&descriptor);
    finish_section(section)
}
