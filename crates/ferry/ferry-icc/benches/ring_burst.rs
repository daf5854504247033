use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ferry_icc::{Handle, Owned, Pool, PoolConfig, Ring, RingConfig, ShmNamespace, SyncMode};

const RING_CAPACITY: usize = 2048;

fn bench_ring_burst(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ns = ShmNamespace::new(dir.path());

    let mut group = c.benchmark_group("ring");
    for (label, mode) in [("sp_sc", SyncMode::Single), ("mp_mc", SyncMode::Multi)] {
        let ring = Ring::<Handle, Owned>::create(
            &ns,
            &format!("bench_{label}"),
            RingConfig::new(RING_CAPACITY).with_modes(mode, mode),
        )
        .expect("create ring");

        for burst in [1usize, 8, 32] {
            let items = vec![Handle::default(); burst];
            let mut out = vec![Handle::default(); burst];
            group.throughput(Throughput::Elements(burst as u64));
            group.bench_with_input(BenchmarkId::new(label, burst), &burst, |b, _| {
                b.iter(|| {
                    let n = ring.enqueue_burst(black_box(&items));
                    black_box(ring.dequeue_burst(&mut out[..n]));
                });
            });
        }
    }
    group.finish();
}

fn bench_ring_full(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ns = ShmNamespace::new(dir.path());
    let ring = Ring::<Handle, Owned>::create(&ns, "bench_full", RingConfig::new(64)).expect("create ring");
    let fill = vec![Handle::default(); 64];
    assert_eq!(ring.enqueue_burst(&fill), 64);

    c.bench_function("ring/enqueue_burst (full)", |b| {
        b.iter(|| black_box(ring.enqueue_burst(black_box(&fill[..32]))));
    });
}

fn bench_pool(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ns = ShmNamespace::new(dir.path());
    let pool = Pool::<Owned>::create(
        &ns,
        "bench_pool",
        PoolConfig {
            slot_size: 2176,
            slot_count: 8191,
        },
    )
    .expect("create pool");

    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));
    group.bench_function("allocate_release", |b| {
        b.iter(|| {
            let h = pool.allocate().expect("slot");
            pool.release(black_box(h)).expect("release");
        });
    });

    let mut handles = [Handle::default(); 32];
    group.throughput(Throughput::Elements(32));
    group.bench_function("allocate_burst_32", |b| {
        b.iter(|| {
            let n = pool.allocate_burst(&mut handles);
            for h in &handles[..n] {
                pool.release(*h).expect("release");
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_ring_burst, bench_ring_full, bench_pool);
criterion_main!(benches);
