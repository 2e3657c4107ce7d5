//! Binary format constants, footer encode/decode, and filename helpers.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::SSTableError;

/// Magic number identifying an SSTable file.
pub const SSTABLE_MAGIC: u32 = 0x4C53_4D31;

/// Original footer without a bloom section.
pub const VERSION_BASE: u16 = 1;
/// Current footer carrying the bloom section span.
pub const VERSION_BLOOM: u16 = 2;

/// v1 footer: `[index_offset: u64][magic: u32][version: u16]`.
pub const FOOTER_BASE_BYTES: u64 = 8 + 4 + 2;
/// v2 footer: `[index_offset: u64][bloom_offset: u64][bloom_len: u64][magic: u32][version: u16]`.
pub const FOOTER_BLOOM_BYTES: u64 = 8 + 8 + 8 + 4 + 2;

/// Decoded footer fields plus the footer's own size, which the reader needs
/// to know where the sparse index ends.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub index_offset: u64,
    /// Zero for v1 files.
    pub bloom_offset: u64,
    /// Zero for v1 files (and legal in v2: "no filter").
    pub bloom_len: u64,
    pub size: u64,
}

/// Writes the current (v2) footer.
pub fn write_footer<W: Write>(
    w: &mut W,
    index_offset: u64,
    bloom_offset: u64,
    bloom_len: u64,
) -> Result<(), SSTableError> {
    w.write_u64::<LittleEndian>(index_offset)?;
    w.write_u64::<LittleEndian>(bloom_offset)?;
    w.write_u64::<LittleEndian>(bloom_len)?;
    w.write_u32::<LittleEndian>(SSTABLE_MAGIC)?;
    w.write_u16::<LittleEndian>(VERSION_BLOOM)?;
    Ok(())
}

/// Reads the footer from the tail of a file of `file_size` bytes.
///
/// The trailing 14 bytes are peeked first: every footer version ends with
/// `[magic][version]`, so the version decides how many bytes to re-read.
pub fn read_footer<R: Read + Seek>(r: &mut R, file_size: u64) -> Result<Footer, SSTableError> {
    if file_size < FOOTER_BASE_BYTES {
        return Err(SSTableError::Corrupt);
    }
    let mut tail = [0u8; FOOTER_BASE_BYTES as usize];
    r.seek(SeekFrom::Start(file_size - FOOTER_BASE_BYTES))?;
    r.read_exact(&mut tail)?;

    let magic = LittleEndian::read_u32(&tail[8..12]);
    let version = LittleEndian::read_u16(&tail[12..14]);
    if magic != SSTABLE_MAGIC {
        return Err(SSTableError::Corrupt);
    }

    match version {
        VERSION_BASE => Ok(Footer {
            index_offset: LittleEndian::read_u64(&tail[0..8]),
            bloom_offset: 0,
            bloom_len: 0,
            size: FOOTER_BASE_BYTES,
        }),
        VERSION_BLOOM => {
            if file_size < FOOTER_BLOOM_BYTES {
                return Err(SSTableError::Corrupt);
            }
            let mut buf = [0u8; FOOTER_BLOOM_BYTES as usize];
            r.seek(SeekFrom::Start(file_size - FOOTER_BLOOM_BYTES))?;
            r.read_exact(&mut buf)?;
            if LittleEndian::read_u32(&buf[24..28]) != SSTABLE_MAGIC
                || LittleEndian::read_u16(&buf[28..30]) != VERSION_BLOOM
            {
                return Err(SSTableError::Corrupt);
            }
            Ok(Footer {
                index_offset: LittleEndian::read_u64(&buf[0..8]),
                bloom_offset: LittleEndian::read_u64(&buf[8..16]),
                bloom_len: LittleEndian::read_u64(&buf[16..24]),
                size: FOOTER_BLOOM_BYTES,
            })
        }
        _ => Err(SSTableError::Corrupt),
    }
}

/// Formats the on-disk name for a table ID: `sstable-000042.sst`.
///
/// IDs wider than six digits simply widen the field.
pub fn filename(id: u64) -> String {
    format!("sstable-{:06}.sst", id)
}

/// Parses an ID back out of a table filename, if it is one.
pub fn parse_filename(name: &str) -> Option<u64> {
    name.strip_prefix("sstable-")?
        .strip_suffix(".sst")?
        .parse()
        .ok()
}
