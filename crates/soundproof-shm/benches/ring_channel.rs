use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use soundproof_shm::{ChannelKind, SharedRegion};

fn bench_round_trip(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bench-region");
    let region = SharedRegion::builder()
        .add_channel(ChannelKind::Request, 256 * 1024, "bench")
        .expect("declare channel")
        .create(&path)
        .expect("create region");
    let mut chan = region.channel_handle(0).expect("channel");
    let mut scratch = Vec::new();

    let mut group = c.benchmark_group("ring_round_trip");
    for size in [64usize, 1024, 16 * 1024] {
        let msg = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                chan.clear();
                assert!(chan.write(&msg));
                let got = chan.read_message(&mut scratch).expect("message");
                criterion::black_box(got.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
