//! # Write-ahead log
//!
//! Append-only journal written before every memtable mutation. On restart the
//! engine replays it to rebuild the buffer the crash threw away.
//!
//! ## Frame layout
//!
//! ```text
//! [record_len: u32 LE][op: u8][seq: u64 LE][key_len: u32 LE][val_len: u32 LE][key][value]
//! ```
//!
//! `record_len` counts everything after itself (`1 + 8 + 4 + 4 + key_len +
//! val_len`); op 1 = put, op 2 = delete (deletes carry `val_len = 0`).
//!
//! There are no per-record checksums. Crash safety comes from the replay
//! policy instead: a torn frame at the tail of the file is the expected
//! artifact of a crash mid-append and is dropped silently, while any
//! structural violation earlier in the file is reported as corruption.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Fixed bytes of a frame body before the key: op + seq + key_len + val_len.
const BODY_HEADER_LEN: usize = 1 + 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put {
        seq: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Del {
        seq: u64,
        key: Vec<u8>,
    },
}

impl WalRecord {
    pub fn seq(&self) -> u64 {
        match self {
            WalRecord::Put { seq, .. } | WalRecord::Del { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record")]
    Corrupt,
}

/// Appends framed records to the log file, optionally fsyncing each one.
pub struct WalWriter {
    file: File,
    sync: bool,
}

impl WalWriter {
    /// Opens `path` for append, creating it if missing.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, sync })
    }

    /// Appends one record as a single whole-frame write.
    ///
    /// With `sync` set the file is fsynced before returning, so an
    /// acknowledged append has reached stable storage.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let (op, seq, key, value): (u8, u64, &[u8], &[u8]) = match record {
            WalRecord::Put { seq, key, value } => (OP_PUT, *seq, key, value),
            WalRecord::Del { seq, key } => (OP_DELETE, *seq, key, &[]),
        };

        let record_len = BODY_HEADER_LEN + key.len() + value.len();
        let mut buf = Vec::with_capacity(4 + record_len);
        buf.write_u32::<LittleEndian>(record_len as u32)?;
        buf.write_u8(op)?;
        buf.write_u64::<LittleEndian>(seq)?;
        buf.write_u32::<LittleEndian>(key.len() as u32)?;
        buf.write_u32::<LittleEndian>(value.len() as u32)?;
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        self.file.write_all(&buf)?;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Sequential reader over a log's frames.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader::from_reader(f))
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every intact record in order, returning the largest sequence
    /// number seen (0 for an empty log).
    ///
    /// A truncated frame at the tail — partial length prefix or a body
    /// shorter than declared — ends replay cleanly; it is the residue of a
    /// crash mid-append, not corruption. A zero-length frame, an unknown op,
    /// or lengths that disagree inside a fully read frame is
    /// [`WalError::Corrupt`].
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64, WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut max_seq = 0u64;
        loop {
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(max_seq),
                Err(e) => return Err(WalError::Io(e)),
            };
            if record_len == 0 {
                return Err(WalError::Corrupt);
            }
            let mut body = vec![0u8; record_len as usize];
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(max_seq),
                Err(e) => return Err(WalError::Io(e)),
            }
            let record = decode_body(&body)?;
            max_seq = max_seq.max(record.seq());
            apply(record);
        }
    }
}

fn decode_body(body: &[u8]) -> Result<WalRecord, WalError> {
    if body.len() < BODY_HEADER_LEN {
        return Err(WalError::Corrupt);
    }
    let mut br = body;
    let op = br.read_u8()?;
    let seq = br.read_u64::<LittleEndian>()?;
    let key_len = br.read_u32::<LittleEndian>()? as usize;
    let val_len = br.read_u32::<LittleEndian>()? as usize;
    if body.len() != BODY_HEADER_LEN + key_len + val_len {
        return Err(WalError::Corrupt);
    }
    let key = br[..key_len].to_vec();
    match op {
        OP_PUT => {
            let value = br[key_len..key_len + val_len].to_vec();
            Ok(WalRecord::Put { seq, key, value })
        }
        OP_DELETE => Ok(WalRecord::Del { seq, key }),
        _ => Err(WalError::Corrupt),
    }
}

/// Replays the log at `path`, returning the max sequence number observed.
///
/// A missing file is an empty log: returns 0 without calling `apply`.
pub fn replay<P, F>(path: P, apply: F) -> Result<u64, WalError>
where
    P: AsRef<Path>,
    F: FnMut(WalRecord),
{
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WalError::Io(e)),
    };
    WalReader::from_reader(f).replay(apply)
}
