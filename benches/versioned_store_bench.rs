//! Benchmarks for the in-memory versioned store

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use atlasnode::mvcc::VersionedStore;
use atlasnode::KeyRange;

const KEYS: u64 = 10_000;

fn key(i: u64) -> Bytes {
    Bytes::from(format!("key{:08}", i))
}

/// One version per 100 keys, every key set once
fn populated() -> VersionedStore {
    let store = VersionedStore::new(0);
    let mut version = 0;
    for i in 0..KEYS {
        if i % 100 == 0 {
            version += 1;
            store.create_new_version(version).unwrap();
        }
        store.set(key(i), Bytes::from_static(b"value"), version).unwrap();
    }
    store
}

fn write_benchmarks(c: &mut Criterion) {
    c.bench_function("set 1k keys in one version", |b| {
        b.iter_batched(
            || {
                let store = VersionedStore::new(0);
                store.create_new_version(1).unwrap();
                store
            },
            |store| {
                for i in 0..1000 {
                    store.set(key(i), Bytes::from_static(b"value"), 1).unwrap();
                }
                store
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("clear range over 10k keys", |b| {
        b.iter_batched(
            || {
                let store = populated();
                let next = store.latest_version() + 1;
                store.create_new_version(next).unwrap();
                (store, next)
            },
            |(store, version)| {
                store
                    .clear(&KeyRange::new(key(1000), key(9000)), version)
                    .unwrap();
                store
            },
            BatchSize::LargeInput,
        )
    });
}

fn read_benchmarks(c: &mut Criterion) {
    let store = populated();
    let latest = store.latest_version();

    c.bench_function("point read at latest version", |b| {
        let view = store.view(latest).unwrap();
        let mut i = 0;
        b.iter(|| {
            i = (i + 7919) % KEYS;
            black_box(view.get(&key(i)))
        })
    });

    c.bench_function("point read at old version", |b| {
        let view = store.view(latest / 2).unwrap();
        let mut i = 0;
        b.iter(|| {
            i = (i + 7919) % KEYS;
            black_box(view.get(&key(i)))
        })
    });

    c.bench_function("range read 100 rows", |b| {
        let view = store.view(latest).unwrap();
        let range = KeyRange::new(key(5000), key(6000));
        b.iter(|| black_box(view.read_range(&range, 100, usize::MAX)))
    });
}

fn retention_benchmarks(c: &mut Criterion) {
    c.bench_function("forget versions before midpoint", |b| {
        b.iter_batched(
            populated,
            |store| {
                let floor = store.latest_version() / 2;
                black_box(store.forget_versions_before(floor));
                store
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, write_benchmarks, read_benchmarks, retention_benchmarks);
criterion_main!(benches);
