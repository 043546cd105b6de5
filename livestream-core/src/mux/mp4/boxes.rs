//! ISO-BMFF box writers.
//!
//! Every box is length-prefixed and big-endian. Writers reserve the 4-byte
//! size field, write the body, then patch the size, so nested boxes never need
//! their sizes computed up front.

use bytes::{BufMut, BytesMut};

/// Movie-level timescale (milliseconds).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Track timescale for video (same clock as MPEG-TS).
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Seconds between 1904-01-01 (MP4 epoch) and 1970-01-01.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// "und" packed as ISO 639-2/T.
const LANGUAGE_UNDETERMINED: u16 = 0x55C4;

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000,
];

/// Write a box: size placeholder, type, body, then patch the size.
pub fn write_box(buf: &mut BytesMut, box_type: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let size_pos = buf.len();
    buf.put_u32(0);
    buf.put_slice(box_type);
    body(buf);
    let size = (buf.len() - size_pos) as u32;
    buf[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box (version + 24-bit flags after the type).
pub fn write_full_box(
    buf: &mut BytesMut,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(buf, box_type, |buf| {
        buf.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        body(buf);
    });
}

/// `stsz`: per-sample sizes, collapsed to one value when all are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSizeBox {
    /// Uniform size, or 0 when sizes vary.
    pub sample_size: u32,
    pub sample_count: u32,
    /// One entry per sample; empty when `sample_size` is set.
    pub entries: Vec<u32>,
}

impl SampleSizeBox {
    pub fn new(sizes: &[u32]) -> Self {
        match sizes.first() {
            Some(&first) if sizes.iter().all(|&size| size == first) => Self {
                sample_size: first,
                sample_count: sizes.len() as u32,
                entries: Vec::new(),
            },
            _ => Self {
                sample_size: 0,
                sample_count: sizes.len() as u32,
                entries: sizes.to_vec(),
            },
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_full_box(buf, b"stsz", 0, 0, |buf| {
            buf.put_u32(self.sample_size);
            buf.put_u32(self.sample_count);
            for &size in &self.entries {
                buf.put_u32(size);
            }
        });
    }
}

/// Run-length encode values into `(count, value)` pairs.
pub fn run_lengths<T: Copy + PartialEq>(values: impl IntoIterator<Item = T>) -> Vec<(u32, T)> {
    let mut entries: Vec<(u32, T)> = Vec::new();
    for value in values {
        match entries.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => entries.push((1, value)),
        }
    }
    entries
}

pub fn write_ftyp(buf: &mut BytesMut) {
    write_box(buf, b"ftyp", |buf| {
        buf.put_slice(b"isom");
        buf.put_u32(0x200);
        for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
            buf.put_slice(brand);
        }
    });
}

/// Movie header. `duration` is in [`MOVIE_TIMESCALE`] units.
pub fn write_mvhd(buf: &mut BytesMut, creation_time: u32, duration: u32, next_track_id: u32) {
    write_full_box(buf, b"mvhd", 0, 0, |buf| {
        buf.put_u32(creation_time);
        buf.put_u32(creation_time);
        buf.put_u32(MOVIE_TIMESCALE);
        buf.put_u32(duration);
        buf.put_u32(0x0001_0000); // rate 1.0
        buf.put_u16(0x0100); // volume 1.0
        buf.put_bytes(0, 10);
        for value in UNITY_MATRIX {
            buf.put_u32(value);
        }
        buf.put_bytes(0, 24);
        buf.put_u32(next_track_id);
    });
}

/// Track header; `width`/`height` are 0 for audio tracks.
pub fn write_tkhd(
    buf: &mut BytesMut,
    creation_time: u32,
    track_id: u32,
    duration: u32,
    width: u32,
    height: u32,
) {
    let is_audio = width == 0 && height == 0;
    // track_enabled | track_in_movie
    write_full_box(buf, b"tkhd", 0, 0x03, |buf| {
        buf.put_u32(creation_time);
        buf.put_u32(creation_time);
        buf.put_u32(track_id);
        buf.put_u32(0);
        buf.put_u32(duration);
        buf.put_bytes(0, 8);
        buf.put_u16(0); // layer
        buf.put_u16(0); // alternate_group
        buf.put_u16(if is_audio { 0x0100 } else { 0 });
        buf.put_u16(0);
        for value in UNITY_MATRIX {
            buf.put_u32(value);
        }
        buf.put_u32(width << 16);
        buf.put_u32(height << 16);
    });
}

pub fn write_mdhd(buf: &mut BytesMut, creation_time: u32, timescale: u32, duration: u32) {
    write_full_box(buf, b"mdhd", 0, 0, |buf| {
        buf.put_u32(creation_time);
        buf.put_u32(creation_time);
        buf.put_u32(timescale);
        buf.put_u32(duration);
        buf.put_u16(LANGUAGE_UNDETERMINED);
        buf.put_u16(0);
    });
}

pub fn write_hdlr(buf: &mut BytesMut, handler_type: &[u8; 4]) {
    let name: &[u8] = match handler_type {
        b"vide" => b"VideoHandler\0",
        b"soun" => b"SoundHandler\0",
        _ => b"DataHandler\0",
    };
    write_full_box(buf, b"hdlr", 0, 0, |buf| {
        buf.put_u32(0);
        buf.put_slice(handler_type);
        buf.put_bytes(0, 12);
        buf.put_slice(name);
    });
}

/// `dinf` with a self-contained `url ` reference.
pub fn write_dinf(buf: &mut BytesMut) {
    write_box(buf, b"dinf", |buf| {
        write_full_box(buf, b"dref", 0, 0, |buf| {
            buf.put_u32(1);
            write_full_box(buf, b"url ", 0, 0x01, |_| {});
        });
    });
}

pub fn write_vmhd(buf: &mut BytesMut) {
    write_full_box(buf, b"vmhd", 0, 0x01, |buf| {
        buf.put_u16(0); // graphicsmode
        buf.put_bytes(0, 6); // opcolor
    });
}

pub fn write_smhd(buf: &mut BytesMut) {
    write_full_box(buf, b"smhd", 0, 0, |buf| {
        buf.put_u16(0); // balance
        buf.put_u16(0);
    });
}

/// `stts` from per-sample durations.
pub fn write_stts(buf: &mut BytesMut, durations: &[u32]) {
    let entries = run_lengths(durations.iter().copied());
    write_full_box(buf, b"stts", 0, 0, |buf| {
        buf.put_u32(entries.len() as u32);
        for (count, duration) in entries {
            buf.put_u32(count);
            buf.put_u32(duration);
        }
    });
}

/// `ctts` from per-sample composition offsets (pts - dts).
pub fn write_ctts(buf: &mut BytesMut, offsets: &[u32]) {
    let entries = run_lengths(offsets.iter().copied());
    write_full_box(buf, b"ctts", 0, 0, |buf| {
        buf.put_u32(entries.len() as u32);
        for (count, offset) in entries {
            buf.put_u32(count);
            buf.put_u32(offset);
        }
    });
}

/// `stss` listing 1-based sync sample numbers.
pub fn write_stss(buf: &mut BytesMut, sync: &[bool]) {
    let numbers: Vec<u32> = sync
        .iter()
        .enumerate()
        .filter(|(_, is_sync)| **is_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    write_full_box(buf, b"stss", 0, 0, |buf| {
        buf.put_u32(numbers.len() as u32);
        for number in numbers {
            buf.put_u32(number);
        }
    });
}

/// `stsc` for one sample per chunk.
pub fn write_stsc(buf: &mut BytesMut, sample_count: usize) {
    write_full_box(buf, b"stsc", 0, 0, |buf| {
        if sample_count == 0 {
            buf.put_u32(0);
        } else {
            buf.put_u32(1);
            buf.put_u32(1); // first_chunk
            buf.put_u32(1); // samples_per_chunk
            buf.put_u32(1); // sample_description_index
        }
    });
}

/// `stco`, or `co64` when an offset does not fit 32 bits.
pub fn write_chunk_offsets(buf: &mut BytesMut, offsets: &[u64]) {
    if offsets.iter().any(|&offset| offset > u32::MAX as u64) {
        write_full_box(buf, b"co64", 0, 0, |buf| {
            buf.put_u32(offsets.len() as u32);
            for &offset in offsets {
                buf.put_u64(offset);
            }
        });
    } else {
        write_full_box(buf, b"stco", 0, 0, |buf| {
            buf.put_u32(offsets.len() as u32);
            for &offset in offsets {
                buf.put_u32(offset as u32);
            }
        });
    }
}

/// MPEG-4 descriptor length in expandable form (1-4 bytes).
pub fn put_descriptor_length(buf: &mut BytesMut, len: usize) {
    let mut groups = Vec::with_capacity(4);
    let mut value = len;
    loop {
        groups.push((value & 0x7F) as u8);
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = groups.len() - 1;
    for (i, group) in groups.iter().rev().enumerate() {
        buf.put_u8(if i < last { group | 0x80 } else { *group });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// First sizes of a recorded 1350-sample AVC track.
    const RECORDED_SIZES: [u32; 32] = [
        23738, 998, 1556, 3325, 1158, 1994, 1676, 1215, 2095, 1421, 1763, 2475, 1448, 1409,
        1233, 1380, 1666, 1240, 2096, 1429, 2161, 1040, 1440, 1405, 1270, 1367, 1682, 1691,
        2228, 1505, 28381, 889,
    ];

    fn u32_at(buf: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn stsz_is_byte_exact_for_variable_sizes() {
        let sizes = &RECORDED_SIZES[..16];
        let mut buf = BytesMut::new();
        SampleSizeBox::new(sizes).write(&mut buf);

        let mut expected = vec![0x00, 0x00, 0x00, 0x54];
        expected.extend_from_slice(b"stsz");
        expected.extend_from_slice(&[0, 0, 0, 0]); // version + flags
        expected.extend_from_slice(&[0, 0, 0, 0]); // variable sizes
        expected.extend_from_slice(&[0, 0, 0, 16]);
        for size in sizes {
            expected.extend_from_slice(&size.to_be_bytes());
        }
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(&buf[20..24], &[0x00, 0x00, 0x5C, 0xBA]); // 23738
    }

    #[test]
    fn stsz_grows_with_sample_count() {
        let mut buf = BytesMut::new();
        SampleSizeBox::new(&RECORDED_SIZES).write(&mut buf);

        assert_eq!(buf.len(), 20 + 4 * RECORDED_SIZES.len());
        assert_eq!(u32_at(&buf, 0) as usize, buf.len());
        assert_eq!(u32_at(&buf, 16), 32);
        assert_eq!(u32_at(&buf, 20 + 4 * 30), 28381);
    }

    #[test]
    fn stsz_collapses_uniform_sizes() {
        let mut buf = BytesMut::new();
        SampleSizeBox::new(&[1024, 1024, 1024]).write(&mut buf);

        assert_eq!(buf.len(), 20);
        assert_eq!(u32_at(&buf, 12), 1024);
        assert_eq!(u32_at(&buf, 16), 3);
    }

    #[test]
    fn patched_sizes_match_nested_content() {
        let mut buf = BytesMut::new();
        write_box(&mut buf, b"moov", |buf| {
            write_full_box(buf, b"mvex", 0, 0, |buf| buf.put_u32(7));
            write_box(buf, b"free", |_| {});
        });

        assert_eq!(u32_at(&buf, 0) as usize, buf.len());
        assert_eq!(u32_at(&buf, 8), 16);
        assert_eq!(&buf[12..16], b"mvex");
        assert_eq!(u32_at(&buf, 24), 8);
    }

    #[test]
    fn run_lengths_group_equal_neighbours() {
        assert_eq!(
            run_lengths([3000u32, 3000, 3000, 1500, 3000]),
            vec![(3, 3000), (1, 1500), (1, 3000)]
        );
        assert!(run_lengths(Vec::<u32>::new()).is_empty());
    }

    #[test]
    fn stss_numbers_are_one_based() {
        let mut buf = BytesMut::new();
        write_stss(&mut buf, &[true, false, false, true]);
        assert_eq!(u32_at(&buf, 12), 2);
        assert_eq!(u32_at(&buf, 16), 1);
        assert_eq!(u32_at(&buf, 20), 4);
    }

    #[test]
    fn co64_used_for_large_offsets() {
        let mut buf = BytesMut::new();
        write_chunk_offsets(&mut buf, &[40, 5_000_000_000]);
        assert_eq!(&buf[4..8], b"co64");

        let mut buf = BytesMut::new();
        write_chunk_offsets(&mut buf, &[40, 1000]);
        assert_eq!(&buf[4..8], b"stco");
    }

    #[test]
    fn descriptor_length_forms() {
        let mut buf = BytesMut::new();
        put_descriptor_length(&mut buf, 25);
        put_descriptor_length(&mut buf, 200);
        assert_eq!(&buf[..], &[25, 0x81, 0x48]);
    }
}
