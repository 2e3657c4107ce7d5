use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use db::{Db, Options};
use tempfile::tempdir;

const N: u64 = 1_000;
const VAL_SIZE: usize = 100;

fn options(dir: &std::path::Path, mem_max: usize, max_sst: usize) -> Options {
    Options {
        dir: dir.to_path_buf(),
        sync_on_write: false,
        memtable_max_bytes: mem_max,
        max_sstables: max_sst,
    }
}

fn db_put_no_flush(c: &mut Criterion) {
    c.bench_function("db_put_no_flush_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let d = Db::open(options(dir.path(), 0, 0)).unwrap();
                (dir, d)
            },
            |(_dir, mut d)| {
                for i in 0..N {
                    d.put(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_put_with_flush(c: &mut Criterion) {
    c.bench_function("db_put_with_flush_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let d = Db::open(options(dir.path(), 4096, 0)).unwrap();
                (dir, d)
            },
            |(_dir, mut d)| {
                for i in 0..N {
                    d.put(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_get_memtable_hit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut d = Db::open(options(dir.path(), 0, 0)).unwrap();
    for i in 0..N {
        d.put(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }

    c.bench_function("db_get_memtable_hit_1k", |b| {
        b.iter(|| {
            for i in 0..N {
                let key = format!("k{:06}", i).into_bytes();
                criterion::black_box(d.get(&key).unwrap());
            }
        });
    });
}

fn db_get_sstable_hit(c: &mut Criterion) {
    // A small flush threshold spreads the keys over several runs; every read
    // walks the table list through bloom gates and sparse-index scans.
    let dir = tempdir().unwrap();
    let mut d = Db::open(options(dir.path(), 8192, 4)).unwrap();
    for i in 0..N {
        d.put(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }

    c.bench_function("db_get_sstable_hit_1k", |b| {
        b.iter(|| {
            for i in 0..N {
                let key = format!("k{:06}", i).into_bytes();
                criterion::black_box(d.get(&key).unwrap());
            }
        });
    });
}

fn db_get_miss(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut d = Db::open(options(dir.path(), 8192, 4)).unwrap();
    for i in 0..N {
        d.put(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }

    // Misses are the bloom filter's showcase: most tables are skipped
    // without touching disk.
    c.bench_function("db_get_miss_1k", |b| {
        b.iter(|| {
            for i in 0..N {
                let key = format!("absent{:06}", i).into_bytes();
                criterion::black_box(d.get(&key).unwrap());
            }
        });
    });
}

fn db_mixed_workload(c: &mut Criterion) {
    c.bench_function("db_mixed_put_get_del_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let d = Db::open(options(dir.path(), 4096, 4)).unwrap();
                (dir, d)
            },
            |(_dir, mut d)| {
                for i in 0..N {
                    let key = format!("k{:06}", i).into_bytes();
                    d.put(&key, &[b'x'; VAL_SIZE]).unwrap();
                    criterion::black_box(d.get(&key).unwrap());
                    if i % 5 == 0 {
                        d.delete(&key).unwrap();
                    }
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    db_put_no_flush,
    db_put_with_flush,
    db_get_memtable_hit,
    db_get_sstable_hit,
    db_get_miss,
    db_mixed_workload,
);

criterion_main!(benches);
