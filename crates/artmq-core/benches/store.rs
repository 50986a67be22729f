//! Universe store benchmarks

use artmq_core::{Channel, ChannelValue, UniverseStore};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn batch_benchmark(c: &mut Criterion) {
    let store = UniverseStore::new();
    let batch: Vec<ChannelValue> = (0..512u16)
        .map(|i| ChannelValue::new(1, Channel::new(i).unwrap(), (i % 256) as u8))
        .collect();

    c.bench_function("set_full_universe_batch", |b| {
        b.iter(|| store.set_channel_values(black_box(&batch)))
    });
}

fn snapshot_benchmark(c: &mut Criterion) {
    let store = UniverseStore::new();
    for universe in 0..32u16 {
        store.set_channel(universe, Channel::new(0).unwrap(), 255);
    }

    c.bench_function("snapshot_32_universes", |b| {
        b.iter(|| black_box(store.get()))
    });
}

criterion_group!(benches, batch_benchmark, snapshot_benchmark);
criterion_main!(benches);
