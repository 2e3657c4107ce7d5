//! # db — the storage engine
//!
//! Ties the pieces together: every write goes WAL → memtable, reads probe the
//! memtable and then the on-disk runs newest-first, a full memtable is
//! flushed to a new SSTable, and too many SSTables are compacted back into
//! one.
//!
//! The engine is a single-writer design. Mutating operations take `&mut
//! self`, which *is* the engine-wide exclusive lock: the borrow checker
//! serializes callers, and flush and compaction run synchronously inside the
//! triggering write. There are no background threads.
//!
//! ## On-disk layout
//!
//! ```text
//! <dir>/
//!   wal.log                  # active write-ahead log
//!   wal.log.old-<seq>        # transient, exists only during (or after a
//!                            # crashed) flush
//!   sstables/
//!     sstable-000001.sst
//!     sstable-000002.sst
//!     *.tmp                  # transient builder output, swept on open
//! ```

use memtable::Memtable;
use sstable::{filename, parse_filename, SSTableError, Table, TableBuilder, DEFAULT_INDEX_STRIDE};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};
use wal::{WalError, WalRecord, WalWriter};

const WAL_FILE: &str = "wal.log";
const OLD_WAL_PREFIX: &str = "wal.log.old-";
const SST_SUBDIR: &str = "sstables";

/// Flat per-record overhead added to the flush-threshold accounting.
const RECORD_OVERHEAD: usize = 32;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("db is closed")]
    Closed,
    #[error("empty key")]
    EmptyKey,
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Table(#[from] SSTableError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Base directory; empty means the current directory.
    pub dir: PathBuf,
    /// Fsync the WAL after every append.
    pub sync_on_write: bool,
    /// Approximate memtable size that triggers a flush; 0 disables flushing.
    pub memtable_max_bytes: usize,
    /// SSTable count above which everything is compacted into one run;
    /// 0 disables compaction.
    pub max_sstables: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            sync_on_write: true,
            memtable_max_bytes: 0,
            max_sstables: 0,
        }
    }
}

/// An open store: WAL, memtable, and the ordered set of SSTables.
pub struct Db {
    closed: bool,
    opts: Options,
    dir: PathBuf,

    mem: Memtable,
    mem_bytes: usize,
    seq: u64,

    wal_path: PathBuf,
    /// `None` after close, or after a failed WAL rotation left the engine
    /// without a usable log (callers should reopen).
    wal: Option<WalWriter>,

    sst_dir: PathBuf,
    next_sst: u64,
    /// Sorted by ID ascending; reads walk it back-to-front.
    tables: Vec<Table>,
}

impl Db {
    /// Opens (creating if necessary) the store under `opts.dir`.
    ///
    /// Sweeps stray `*.tmp` builder output, loads the existing SSTables,
    /// replays any rotated-then-orphaned WALs and the active WAL, and sets
    /// the sequence counter past everything observed.
    pub fn open(opts: Options) -> Result<Db> {
        let dir = if opts.dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            opts.dir.clone()
        };
        fs::create_dir_all(&dir)?;
        let sst_dir = dir.join(SST_SUBDIR);
        fs::create_dir_all(&sst_dir)?;
        cleanup_tmp_files(&sst_dir)?;

        let (mut tables, mut next_sst) = load_tables(&sst_dir)?;

        let wal_path = dir.join(WAL_FILE);
        let old_wals = rotated_wals(&dir)?;

        let mut mem = Memtable::new();
        let mut max_seq = 0u64;
        for path in &old_wals {
            max_seq = max_seq.max(wal::replay(path, |r| apply_record(&mut mem, r))?);
        }
        max_seq = max_seq.max(wal::replay(&wal_path, |r| apply_record(&mut mem, r))?);

        if !old_wals.is_empty() {
            // A crash (or error) interrupted a flush. Make the recovered
            // records durable in a run of their own before discarding the
            // rotated logs; if the build fails the logs stay for next time.
            if !mem.is_empty() {
                let id = next_sst;
                next_sst += 1;
                let path = sst_dir.join(filename(id));
                debug!(keys = mem.len(), table = id, "recovering rotated wal into sstable");
                TableBuilder::build(&path, &mem, DEFAULT_INDEX_STRIDE)?;
                tables.push(Table::open(&path, id)?);
                tables.sort_by_key(Table::id);
            }
            for path in &old_wals {
                fs::remove_file(path)?;
            }
            if wal_path.exists() {
                fs::remove_file(&wal_path)?;
            }
            mem = Memtable::new();
        }

        let wal = WalWriter::create(&wal_path, opts.sync_on_write)?;
        Ok(Db {
            closed: false,
            opts,
            dir,
            mem,
            mem_bytes: 0,
            seq: max_seq + 1,
            wal_path,
            wal: Some(wal),
            sst_dir,
            next_sst,
            tables,
        })
    }

    /// Stores `value` under `key`.
    ///
    /// The record is in the WAL (fsynced, if configured) before this returns.
    /// May trigger a flush, and through it a compaction, on this call.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        if self.closed {
            return Err(DbError::Closed);
        }
        let seq = self.seq;
        self.seq += 1;
        let wal = self.wal.as_mut().ok_or(DbError::Closed)?;
        wal.append(&WalRecord::Put {
            seq,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.mem.put(key.to_vec(), value.to_vec(), seq);
        self.mem_bytes += key.len() + value.len() + RECORD_OVERHEAD;
        self.maybe_flush()
    }

    /// Deletes `key` by writing a tombstone.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        if self.closed {
            return Err(DbError::Closed);
        }
        let seq = self.seq;
        self.seq += 1;
        let wal = self.wal.as_mut().ok_or(DbError::Closed)?;
        wal.append(&WalRecord::Del {
            seq,
            key: key.to_vec(),
        })?;
        self.mem.delete(key.to_vec(), seq);
        self.mem_bytes += key.len() + RECORD_OVERHEAD;
        self.maybe_flush()
    }

    /// Looks up `key`, returning `None` for missing and deleted keys alike.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        if self.closed {
            return Err(DbError::Closed);
        }

        if let Some(entry) = self.mem.get_entry(key) {
            trace!("get: hit in memtable");
            return Ok(entry.value.clone());
        }
        trace!(tables = self.tables.len(), "get: probing sstables");

        for table in self.tables.iter().rev() {
            if !table.maybe_contains(key) {
                trace!(table = table.id(), "get: skipped by bloom filter");
                continue;
            }
            match table.get(key)? {
                Some(entry) => {
                    trace!(
                        table = table.id(),
                        tombstone = entry.is_tombstone(),
                        "get: found"
                    );
                    return Ok(entry.value);
                }
                None => {
                    trace!(table = table.id(), "get: bloom false positive");
                }
            }
        }
        Ok(None)
    }

    /// Closes the WAL. Idempotent; every later operation fails with
    /// [`DbError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.wal.take();
        self.closed = true;
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.opts.memtable_max_bytes == 0 || self.mem_bytes < self.opts.memtable_max_bytes {
            return Ok(());
        }
        self.flush()
    }

    /// Promotes the memtable to a new SSTable and retires the current WAL.
    ///
    /// The WAL is rotated aside first and deleted only after the run is
    /// durable, so a crash anywhere in between is recoverable from the
    /// rotated file on the next open.
    fn flush(&mut self) -> Result<()> {
        let old_wal_path = self.dir.join(format!("{}{}", OLD_WAL_PREFIX, self.seq));
        self.wal.take();
        fs::rename(&self.wal_path, &old_wal_path)?;
        match WalWriter::create(&self.wal_path, self.opts.sync_on_write) {
            Ok(w) => self.wal = Some(w),
            Err(e) => {
                let _ = fs::rename(&old_wal_path, &self.wal_path);
                return Err(e.into());
            }
        }

        let immutable = std::mem::take(&mut self.mem);
        self.mem_bytes = 0;

        let id = self.next_sst;
        self.next_sst += 1;
        let sst_path = self.sst_dir.join(filename(id));
        debug!(keys = immutable.len(), table = id, "flushing memtable");
        TableBuilder::build(&sst_path, &immutable, DEFAULT_INDEX_STRIDE)?;
        let table = Table::open(&sst_path, id)?;
        self.tables.push(table);
        self.tables.sort_by_key(Table::id);

        // The run is durable; the rotated WAL has nothing left to add.
        let _ = fs::remove_file(&old_wal_path);

        if self.opts.max_sstables > 0 && self.tables.len() > self.opts.max_sstables {
            return self.compact();
        }
        Ok(())
    }

    /// Merges every current SSTable into a single run.
    fn compact(&mut self) -> Result<()> {
        if self.tables.len() <= 1 {
            return Ok(());
        }
        let out_id = self.next_sst;
        self.next_sst += 1;
        debug!(inputs = self.tables.len(), table = out_id, "compacting sstables");
        if let Some(table) = compaction::run(&self.sst_dir, &self.tables, out_id)? {
            self.tables = vec![table];
        }
        Ok(())
    }
}

fn apply_record(mem: &mut Memtable, record: WalRecord) {
    match record {
        WalRecord::Put { seq, key, value } => mem.put(key, value, seq),
        WalRecord::Del { seq, key } => mem.delete(key, seq),
    }
}

fn cleanup_tmp_files(sst_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(sst_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(".tmp") {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

fn load_tables(sst_dir: &Path) -> Result<(Vec<Table>, u64)> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    let mut max_id = 0u64;
    for entry in fs::read_dir(sst_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = parse_filename(name) else { continue };
        max_id = max_id.max(id);
        found.push((id, entry.path()));
    }
    found.sort_by_key(|(id, _)| *id);

    let mut tables = Vec::with_capacity(found.len());
    for (id, path) in found {
        tables.push(Table::open(&path, id)?);
    }
    Ok((tables, max_id + 1))
}

fn rotated_wals(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(OLD_WAL_PREFIX) else { continue };
        let Ok(seq) = suffix.parse::<u64>() else { continue };
        found.push((seq, entry.path()));
    }
    found.sort_by_key(|(seq, _)| *seq);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}
