use bloom::BloomFilter;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use memtable::ValueEntry;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use crate::format::read_footer;
use crate::SSTableError;

/// One sparse-index entry: the key of an indexed record and its absolute
/// file offset.
#[derive(Debug, Clone)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
}

/// An open SSTable, ready for point lookups.
///
/// Opening loads the sparse index and the bloom filter into memory; the data
/// file itself is re-opened per lookup, so a `Table` holds no long-lived file
/// descriptor.
pub struct Table {
    path: PathBuf,
    id: u64,
    index: Vec<IndexEntry>,
    /// First byte past the data section: the bloom section when one exists,
    /// otherwise the sparse index. Forward scans must stop here.
    data_end: u64,
    bloom: Option<BloomFilter>,
}

impl Table {
    /// Opens the table at `path`, validating the footer and loading the
    /// sparse index (and bloom filter, when present).
    ///
    /// Any structural inconsistency — bad magic, unknown footer version,
    /// out-of-range section offsets, a truncated index entry, an undecodable
    /// bloom section — is [`SSTableError::Corrupt`].
    pub fn open<P: AsRef<Path>>(path: P, id: u64) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let file_size = f.metadata()?.len();

        let footer = read_footer(&mut f, file_size)?;
        if footer.index_offset >= file_size {
            return Err(SSTableError::Corrupt);
        }
        let index_len = file_size
            .checked_sub(footer.size)
            .and_then(|end| end.checked_sub(footer.index_offset))
            .ok_or(SSTableError::Corrupt)?;

        let data_end = if footer.bloom_len > 0 {
            if footer.bloom_offset > footer.index_offset {
                return Err(SSTableError::Corrupt);
            }
            footer.bloom_offset
        } else {
            footer.index_offset
        };

        // The sparse index is small by construction; read it whole and parse
        // from memory.
        f.seek(SeekFrom::Start(footer.index_offset))?;
        let mut raw = vec![0u8; index_len as usize];
        f.read_exact(&mut raw)?;
        let index = parse_index(&raw, data_end)?;

        let bloom = if footer.bloom_len > 0 {
            let end = footer
                .bloom_offset
                .checked_add(footer.bloom_len)
                .ok_or(SSTableError::Corrupt)?;
            if footer.bloom_offset >= file_size || end > file_size {
                return Err(SSTableError::Corrupt);
            }
            f.seek(SeekFrom::Start(footer.bloom_offset))?;
            let mut buf = vec![0u8; footer.bloom_len as usize];
            f.read_exact(&mut buf)?;
            Some(BloomFilter::decode(&buf).ok_or(SSTableError::Corrupt)?)
        } else {
            None
        };

        Ok(Self {
            path,
            id,
            index,
            data_end,
            bloom,
        })
    }

    /// Numeric ID encoded in the filename; higher means more recent.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bloom-filter gate for the read path.
    ///
    /// `false` means the key is definitely absent and the table can be
    /// skipped. Tables without a filter (v1 files) always answer `true`.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(f) => f.maybe_contains(key),
            None => true,
        }
    }

    /// Point lookup.
    ///
    /// Binary-searches the sparse index for the scan start, then reads
    /// records forward until the key is found, a larger key proves it absent,
    /// or the data section ends. The returned entry may be a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueEntry>, SSTableError> {
        let start = self.seek_start_offset(key);
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(start))?;
        let mut rdr = BufReader::new(f).take(self.data_end - start);

        while let Some((rec_key, entry)) = read_record(&mut rdr)? {
            match rec_key.as_slice().cmp(key) {
                Ordering::Equal => return Ok(Some(entry)),
                Ordering::Greater => return Ok(None),
                Ordering::Less => continue,
            }
        }
        Ok(None)
    }

    /// Forward scan over the whole data section, used by compaction.
    pub fn iter(&self) -> Result<TableIter, SSTableError> {
        let f = File::open(&self.path)?;
        Ok(TableIter {
            rdr: BufReader::new(f).take(self.data_end),
        })
    }

    /// Largest indexed offset whose key is `<=` the target, or 0 when the
    /// target sorts before every indexed key.
    fn seek_start_offset(&self, key: &[u8]) -> u64 {
        let n = self.index.partition_point(|e| e.key.as_slice() <= key);
        if n == 0 {
            0
        } else {
            self.index[n - 1].offset
        }
    }
}

/// Streaming cursor over a table's data section, in key order.
pub struct TableIter {
    rdr: Take<BufReader<File>>,
}

impl TableIter {
    /// Next record, or `None` when the data section is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, ValueEntry)>, SSTableError> {
        read_record(&mut self.rdr)
    }
}

fn parse_index(mut raw: &[u8], data_end: u64) -> Result<Vec<IndexEntry>, SSTableError> {
    let mut index = Vec::new();
    while !raw.is_empty() {
        let key_len = raw
            .read_u32::<LittleEndian>()
            .map_err(|_| SSTableError::Corrupt)? as usize;
        if key_len == 0 || raw.len() < key_len + 8 {
            return Err(SSTableError::Corrupt);
        }
        let (key, rest) = raw.split_at(key_len);
        let offset = LittleEndian::read_u64(&rest[..8]);
        if offset >= data_end {
            return Err(SSTableError::Corrupt);
        }
        index.push(IndexEntry {
            key: key.to_vec(),
            offset,
        });
        raw = &rest[8..];
    }
    Ok(index)
}

/// Decodes one data record: `[u32 key_len][key][u8 tombstone][u32 val_len]
/// [value][u64 seq]`.
///
/// A clean end at a record boundary yields `Ok(None)`; a record cut short
/// mid-entry is corruption — torn tails are a WAL phenomenon, never a legal
/// state for an immutable run.
fn read_record<R: Read>(r: &mut R) -> Result<Option<(Vec<u8>, ValueEntry)>, SSTableError> {
    let mut len_buf = [0u8; 4];
    match read_full(r, &mut len_buf)? {
        Fill::Eof => return Ok(None),
        Fill::Partial => return Err(SSTableError::Corrupt),
        Fill::Full => {}
    }
    let key_len = LittleEndian::read_u32(&len_buf) as usize;
    if key_len == 0 {
        return Err(SSTableError::Corrupt);
    }
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key).map_err(map_eof_to_corrupt)?;

    let tombstone = r.read_u8().map_err(map_eof_to_corrupt)?;
    let val_len = r
        .read_u32::<LittleEndian>()
        .map_err(map_eof_to_corrupt)? as usize;
    let mut value = vec![0u8; val_len];
    r.read_exact(&mut value).map_err(map_eof_to_corrupt)?;
    let seq = r.read_u64::<LittleEndian>().map_err(map_eof_to_corrupt)?;

    let entry = ValueEntry {
        seq,
        value: if tombstone == 1 { None } else { Some(value) },
    };
    Ok(Some((key, entry)))
}

fn map_eof_to_corrupt(e: io::Error) -> SSTableError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SSTableError::Corrupt
    } else {
        SSTableError::Io(e)
    }
}

enum Fill {
    Full,
    Eof,
    Partial,
}

/// `read_exact` that distinguishes "no bytes at all" from "cut off mid-way".
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<Fill, SSTableError> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => return Ok(if n == 0 { Fill::Eof } else { Fill::Partial }),
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SSTableError::Io(e)),
        }
    }
    Ok(Fill::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SSTABLE_MAGIC, VERSION_BASE};
    use crate::TableBuilder;
    use byteorder::WriteBytesExt;
    use memtable::Memtable;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_memtable() -> Memtable {
        let mut m = Memtable::new();
        m.put(b"a".to_vec(), b"apple".to_vec(), 1);
        m.put(b"b".to_vec(), b"banana".to_vec(), 2);
        m.put(b"c".to_vec(), Vec::new(), 3);
        m.delete(b"d".to_vec(), 4);
        m
    }

    fn build_sample(dir: &Path, name: &str) -> Table {
        let path = dir.join(name);
        TableBuilder::build(&path, &sample_memtable(), 16).unwrap();
        Table::open(&path, 1).unwrap()
    }

    // -------------------- Open & point lookups --------------------

    #[test]
    fn open_and_get_entries() {
        let dir = tempdir().unwrap();
        let table = build_sample(dir.path(), "sample.sst");

        let a = table.get(b"a").unwrap().expect("a present");
        assert_eq!(a.seq, 1);
        assert_eq!(a.value.as_deref(), Some(&b"apple"[..]));

        let c = table.get(b"c").unwrap().expect("c present");
        assert_eq!(c.value.as_deref(), Some(&b""[..]));
        assert!(!c.is_tombstone());

        let d = table.get(b"d").unwrap().expect("d present");
        assert_eq!(d.seq, 4);
        assert!(d.is_tombstone());
    }

    #[test]
    fn get_misses_cleanly() {
        let dir = tempdir().unwrap();
        let table = build_sample(dir.path(), "sample.sst");

        // Before the first key, between keys, after the last key.
        assert!(table.get(b"0").unwrap().is_none());
        assert!(table.get(b"bb").unwrap().is_none());
        assert!(table.get(b"zzz").unwrap().is_none());
    }

    #[test]
    fn lookup_past_last_key_does_not_misread_bloom_bytes() {
        // A key sorting after every record forces the scan to run to the end
        // of the data section; it must stop there, not wander into the filter.
        let dir = tempdir().unwrap();
        let path = dir.path().join("tail.sst");
        let mut m = Memtable::new();
        for i in 0..50u64 {
            m.put(format!("k{:03}", i).into_bytes(), b"v".to_vec(), i + 1);
        }
        TableBuilder::build(&path, &m, 4).unwrap();
        let table = Table::open(&path, 1).unwrap();

        assert!(table.get(b"k999").unwrap().is_none());
    }

    // -------------------- Sparse index --------------------

    #[test]
    fn every_key_is_reachable_through_the_sparse_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("many.sst");
        let mut m = Memtable::new();
        for i in 0..200u64 {
            m.put(
                format!("key{:05}", i).into_bytes(),
                format!("val{}", i).into_bytes(),
                i + 1,
            );
        }
        TableBuilder::build(&path, &m, 16).unwrap();
        let table = Table::open(&path, 1).unwrap();

        for i in 0..200u64 {
            let key = format!("key{:05}", i).into_bytes();
            let entry = table.get(&key).unwrap().expect("key present");
            assert_eq!(entry.seq, i + 1);
            assert_eq!(entry.value.unwrap(), format!("val{}", i).into_bytes());
        }
    }

    #[test]
    fn stride_one_indexes_every_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dense.sst");
        let mut m = Memtable::new();
        for i in 0..20u64 {
            m.put(format!("k{:02}", i).into_bytes(), b"v".to_vec(), i + 1);
        }
        TableBuilder::build(&path, &m, 1).unwrap();
        let table = Table::open(&path, 1).unwrap();
        assert_eq!(table.index.len(), 20);
        for i in 0..20u64 {
            assert!(table.get(format!("k{:02}", i).as_bytes()).unwrap().is_some());
        }
    }

    // -------------------- Bloom filter --------------------

    #[test]
    fn bloom_has_no_false_negatives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bloomy.sst");
        let mut m = Memtable::new();
        for i in 0..500u64 {
            m.put(format!("key{}", i).into_bytes(), b"v".to_vec(), i + 1);
        }
        m.delete(b"gone".to_vec(), 501);
        TableBuilder::build(&path, &m, 16).unwrap();
        let table = Table::open(&path, 1).unwrap();

        for i in 0..500u64 {
            assert!(table.maybe_contains(format!("key{}", i).as_bytes()));
        }
        // Tombstoned keys are still members of the run.
        assert!(table.maybe_contains(b"gone"));
    }

    // -------------------- Data section scan order --------------------

    #[test]
    fn iter_yields_sorted_unique_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.sst");
        let mut m = Memtable::new();
        for i in (0..100u64).rev() {
            m.put(format!("k{:03}", i).into_bytes(), b"v".to_vec(), i + 1);
        }
        m.delete(b"k050".to_vec(), 200);
        TableBuilder::build(&path, &m, 8).unwrap();
        let table = Table::open(&path, 1).unwrap();

        let mut it = table.iter().unwrap();
        let mut prev: Option<Vec<u8>> = None;
        let mut count = 0usize;
        while let Some((key, _)) = it.next_entry().unwrap() {
            if let Some(p) = &prev {
                assert!(key > *p, "keys must be strictly ascending");
            }
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 100);
    }

    // -------------------- v1 compatibility --------------------

    fn write_v1_table(path: &Path, records: &[(&[u8], &[u8], u64)]) {
        let mut f = std::fs::File::create(path).unwrap();
        let mut offsets = Vec::new();
        let mut pos = 0u64;
        for (key, value, seq) in records {
            offsets.push((key.to_vec(), pos));
            f.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            f.write_all(key).unwrap();
            f.write_u8(0).unwrap();
            f.write_u32::<LittleEndian>(value.len() as u32).unwrap();
            f.write_all(value).unwrap();
            f.write_u64::<LittleEndian>(*seq).unwrap();
            pos += 4 + key.len() as u64 + 1 + 4 + value.len() as u64 + 8;
        }
        let index_offset = pos;
        for (key, off) in &offsets {
            f.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            f.write_all(key).unwrap();
            f.write_u64::<LittleEndian>(*off).unwrap();
        }
        f.write_u64::<LittleEndian>(index_offset).unwrap();
        f.write_u32::<LittleEndian>(SSTABLE_MAGIC).unwrap();
        f.write_u16::<LittleEndian>(VERSION_BASE).unwrap();
    }

    #[test]
    fn v1_files_without_bloom_are_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.sst");
        write_v1_table(
            &path,
            &[(b"alpha", b"1", 1), (b"beta", b"2", 2), (b"gamma", b"3", 3)],
        );

        let table = Table::open(&path, 7).unwrap();
        assert_eq!(table.id(), 7);
        // No filter: everything may be present.
        assert!(table.maybe_contains(b"anything"));

        let beta = table.get(b"beta").unwrap().expect("beta present");
        assert_eq!(beta.value.as_deref(), Some(&b"2"[..]));
        assert!(table.get(b"delta").unwrap().is_none());
    }

    // -------------------- Corruption --------------------

    #[test]
    fn open_rejects_tiny_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.sst");
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&[0xBA, 0xAD, 0xF0, 0x0D]);
        data.extend_from_slice(&1u16.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_rejects_out_of_range_index_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("range.sst");
        let mut data = Vec::new();
        data.extend_from_slice(&10_000u64.to_le_bytes());
        data.extend_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        data.extend_from_slice(&VERSION_BASE.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_rejects_truncated_index_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncidx.sst");
        // Index region declares a 5-byte key but holds only the length prefix.
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(5).unwrap();
        let index_offset = 0u64;
        data.extend_from_slice(&index_offset.to_le_bytes());
        data.extend_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        data.extend_from_slice(&VERSION_BASE.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_rejects_zero_length_index_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zerokey.sst");
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(0).unwrap(); // key_len == 0
        data.write_u64::<LittleEndian>(0).unwrap();
        let index_offset = 0u64;
        data.extend_from_slice(&index_offset.to_le_bytes());
        data.extend_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        data.extend_from_slice(&VERSION_BASE.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_rejects_undecodable_bloom_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("badbloom.sst");
        TableBuilder::build(&path, &sample_memtable(), 16).unwrap();

        // Zero the bloom section's k byte in place.
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        let bloom_offset = u64::from_le_bytes(bytes[n - 22..n - 14].try_into().unwrap()) as usize;
        bytes[bloom_offset] = 0;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Table::open(&path, 1),
            Err(SSTableError::Corrupt)
        ));
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let res = Table::open("/no/such/dir/sstable-000001.sst", 1);
        assert!(matches!(res, Err(SSTableError::Io(_))));
    }

    // -------------------- Empty table --------------------

    #[test]
    fn empty_table_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.sst");
        TableBuilder::build(&path, &Memtable::new(), 16).unwrap();
        let table = Table::open(&path, 1).unwrap();

        assert!(table.get(b"anything").unwrap().is_none());
        let mut it = table.iter().unwrap();
        assert!(it.next_entry().unwrap().is_none());
    }
}
