//! Criterion benchmarks for the packet exchange hot paths.
//!
//! The sampling loops spend most of their time between edges, so the cost that matters is
//! what one edge or one frame adds:
//! - Writing one edge record into the active slot
//! - Publishing a slot (ownership handoff)
//! - Copying a ready record out on the relay side
//!
//! Run with: cargo bench --bench exchange

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use encoder_daq::data::layout::{counter, ChannelLayout, COUNTER_CHANNEL, IRIG_CHANNEL};
use encoder_daq::data::{Consumer, Packet, Publisher, SharedRegion};
use std::sync::Arc;

fn region() -> Arc<SharedRegion> {
    let region = SharedRegion::anonymous().unwrap();
    region.initialise_session();
    region
}

/// One edge: clock, overflow and edge index words.
fn exchange_write_edge(c: &mut Criterion) {
    let mut publisher = Publisher::new(region(), COUNTER_CHANNEL);
    let mut i = 0usize;
    c.bench_function("exchange_write_edge", |b| {
        b.iter(|| {
            let fill = i % 150;
            publisher.write(0, counter::CLOCK + fill, black_box(i as u32));
            publisher.write(0, counter::OVERFLOW + fill, 0);
            publisher.write(0, counter::EDGE_INDEX + fill, black_box(i as u32));
            i += 1;
        });
    });
}

/// Publish then take, per channel, with no contention.
fn exchange_publish_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange_publish_take");

    let channels: [(&str, ChannelLayout); 2] =
        [("counter", COUNTER_CHANNEL), ("irig", IRIG_CHANNEL)];
    for (name, layout) in channels {
        let region = region();
        let mut publisher = Publisher::new(Arc::clone(&region), layout);
        let mut consumer = Consumer::new(region, layout);
        let mut slot = 0;

        group.throughput(Throughput::Bytes(layout.record_bytes() as u64));
        group.bench_with_input(BenchmarkId::new("round", name), &layout, |b, _| {
            b.iter(|| {
                publisher.publish(slot);
                slot ^= 1;
                black_box(consumer.take())
            });
        });
    }

    group.finish();
}

/// Decoding a relayed counter packet on the receiving side.
fn exchange_decode_counter(c: &mut Criterion) {
    let region = region();
    let mut publisher = Publisher::new(Arc::clone(&region), COUNTER_CHANNEL);
    let mut consumer = Consumer::new(region, COUNTER_CHANNEL);
    publisher.publish(0);
    let datagram = consumer.take().map(|r| r.to_bytes()).unwrap_or_default();

    c.bench_function("exchange_decode_counter", |b| {
        b.iter(|| Packet::decode(black_box(&datagram)).unwrap());
    });
}

criterion_group!(
    benches,
    exchange_write_edge,
    exchange_publish_take,
    exchange_decode_counter
);
criterion_main!(benches);
