use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use basalt_shm::{ConfigStore, StoreOptions};

fn temp_store(tag: &str) -> (tempfile::TempDir, ConfigStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ConfigStore::create(
        dir.path().join(tag),
        StoreOptions {
            arena_size: 8 << 20,
            ..StoreOptions::default()
        },
    )
    .expect("failed to create store");
    (dir, store)
}

fn bench_install(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    for size in [256usize, 4 << 10, 256 << 10] {
        let (_dir, store) = temp_store("crit_install");
        let payload = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("install", size), &payload, |b, p| {
            b.iter(|| store.install(black_box(p)).expect("install"));
        });
    }

    drop(group);
}

fn bench_snapshot_and_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    for size in [256usize, 4 << 10, 256 << 10] {
        let (_dir, store) = temp_store("crit_snapshot");
        let payload = vec![b'y'; size];
        let mut buf = Vec::with_capacity(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("install+snapshot_and_release", size), |b| {
            b.iter(|| {
                store.install_with_readers(&payload, 1).expect("install");
                black_box(store.snapshot_and_release_into(&mut buf).expect("snapshot"));
            });
        });
    }

    drop(group);
}

fn bench_uncontended_refcount(c: &mut Criterion) {
    let (_dir, store) = temp_store("crit_refcount");
    c.bench_function("store/refcount (lock round trip)", |b| {
        b.iter(|| black_box(store.refcount()));
    });
}

criterion_group!(
    benches,
    bench_install,
    bench_snapshot_and_release,
    bench_uncontended_refcount
);
criterion_main!(benches);
