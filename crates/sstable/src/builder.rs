use bloom::BloomFilter;
use byteorder::{LittleEndian, WriteBytesExt};
use memtable::{Memtable, ValueEntry};
use std::fs::{rename, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use crate::format::write_footer;
use crate::{SSTableError, DEFAULT_INDEX_STRIDE};

/// Writes a [`Memtable`] to disk as an immutable SSTable file.
///
/// The builder is stateless — all work happens inside the single
/// [`build`](TableBuilder::build) call. The write is crash-safe: everything
/// goes to `<path>.tmp` first, is fsynced, and is then atomically renamed
/// onto the final path, so a crash mid-build leaves only a temp file for the
/// next open to sweep up.
pub struct TableBuilder;

impl TableBuilder {
    /// Flushes `mem` to a new SSTable at `path`.
    ///
    /// Records are written in the memtable's ascending key order, tombstones
    /// included. Every key is fed to a bloom filter sized at 10 bits per key,
    /// and every `index_every_n`-th record (the first one included; 0 falls
    /// back to [`DEFAULT_INDEX_STRIDE`]) gets a sparse-index entry pointing
    /// at its data offset.
    pub fn build(path: &Path, mem: &Memtable, index_every_n: usize) -> Result<(), SSTableError> {
        let stride = if index_every_n == 0 {
            DEFAULT_INDEX_STRIDE
        } else {
            index_every_n
        };

        let tmp = tmp_path(path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;

        // Data section. Records are staged in a scratch buffer and written
        // whole, so stream_position() is always a record boundary.
        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut filter = BloomFilter::for_keys(mem.len(), 10, 7);
        let mut scratch = Vec::new();
        for (i, (key, entry)) in mem.iter().enumerate() {
            let offset = file.stream_position()?;
            if i % stride == 0 {
                index.push((key.clone(), offset));
            }
            filter.add(key);
            encode_record(&mut scratch, key, entry)?;
            file.write_all(&scratch)?;
        }

        // Bloom section.
        let bloom_offset = file.stream_position()?;
        let bloom_bytes = filter.encode();
        file.write_all(&bloom_bytes)?;

        // Sparse index.
        let index_offset = file.stream_position()?;
        for (key, data_offset) in &index {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_all(key)?;
            file.write_u64::<LittleEndian>(*data_offset)?;
        }

        write_footer(
            &mut file,
            index_offset,
            bloom_offset,
            bloom_bytes.len() as u64,
        )?;

        file.sync_all()?;
        rename(tmp, path)?;
        Ok(())
    }
}

/// `sstable-000001.sst` → `sstable-000001.sst.tmp`.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn encode_record(buf: &mut Vec<u8>, key: &[u8], entry: &ValueEntry) -> Result<(), SSTableError> {
    let value: &[u8] = entry.value.as_deref().unwrap_or(&[]);
    buf.clear();
    buf.write_u32::<LittleEndian>(key.len() as u32)?;
    buf.extend_from_slice(key);
    buf.write_u8(entry.is_tombstone() as u8)?;
    buf.write_u32::<LittleEndian>(value.len() as u32)?;
    buf.extend_from_slice(value);
    buf.write_u64::<LittleEndian>(entry.seq)?;
    Ok(())
}
