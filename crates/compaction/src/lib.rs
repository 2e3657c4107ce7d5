//! # Compaction
//!
//! Collapses a set of SSTables into a single run via a k-way merge.
//!
//! Each input table contributes a sorted cursor over its data section; a
//! min-heap keyed on the cursors' current keys drives the merge. When the
//! same key appears in several inputs, the record with the largest sequence
//! number wins — regardless of which table the heap happened to pop first.
//! Tombstones are carried through to the output: with a single level of runs
//! there is no point at which a delete marker is provably unneeded.
//!
//! The merged output is staged through the table builder's temp-file + rename
//! protocol, so a crash mid-compaction leaves the inputs untouched. Input
//! files are unlinked only after the output is in place, and only
//! best-effort: a leftover input is re-merged next time, not a correctness
//! problem.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs;
use std::path::Path;

use memtable::{Memtable, ValueEntry};
use sstable::{filename, SSTableError, Table, TableBuilder, TableIter, DEFAULT_INDEX_STRIDE};

/// Merges `inputs` into one new table with ID `output_id` inside `sst_dir`.
///
/// Returns the opened output table, or `None` when `inputs` is empty. On
/// success the input files have been unlinked (best-effort) and the returned
/// handle is the only live run for their keys.
pub fn run(
    sst_dir: &Path,
    inputs: &[Table],
    output_id: u64,
) -> Result<Option<Table>, SSTableError> {
    if inputs.is_empty() {
        return Ok(None);
    }

    let mut cursors: Vec<TableIter> = Vec::with_capacity(inputs.len());
    for table in inputs {
        cursors.push(table.iter()?);
    }

    // Prime the heap with each table's first record.
    let mut heap = BinaryHeap::new();
    for (source, cursor) in cursors.iter_mut().enumerate() {
        if let Some((key, entry)) = cursor.next_entry()? {
            heap.push(HeapEntry { key, entry, source });
        }
    }

    // The merge emits one winning record per key into a fresh memtable; the
    // table builder then writes it out in one pass.
    let mut merged = Memtable::new();
    let mut pending: Option<(Vec<u8>, ValueEntry)> = None;

    while let Some(HeapEntry { key, entry, source }) = heap.pop() {
        match &mut pending {
            Some((pkey, pentry)) if *pkey == key => {
                if entry.seq > pentry.seq {
                    *pentry = entry;
                }
            }
            _ => {
                if let Some((k, e)) = pending.take() {
                    emit(&mut merged, k, e);
                }
                pending = Some((key, entry));
            }
        }
        if let Some((key, entry)) = cursors[source].next_entry()? {
            heap.push(HeapEntry { key, entry, source });
        }
    }
    if let Some((k, e)) = pending.take() {
        emit(&mut merged, k, e);
    }

    let out_path = sst_dir.join(filename(output_id));
    TableBuilder::build(&out_path, &merged, DEFAULT_INDEX_STRIDE)?;

    for table in inputs {
        let _ = fs::remove_file(table.path());
    }

    Table::open(&out_path, output_id).map(Some)
}

fn emit(merged: &mut Memtable, key: Vec<u8>, entry: ValueEntry) {
    match entry.value {
        Some(v) => merged.put(key, v, entry.seq),
        None => merged.delete(key, entry.seq),
    }
}

/// A cursor's current record, ranked for a min-heap on key bytes.
struct HeapEntry {
    key: Vec<u8>,
    entry: ValueEntry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the smallest key first. Equal keys may
        // pop in any order; the max-seq rule above makes that immaterial.
        self.key
            .cmp(&other.key)
            .reverse()
            .then_with(|| self.source.cmp(&other.source).reverse())
    }
}
