#[macro_use]
extern crate criterion;

use criterion::Criterion;

extern crate tally;

use tally::buffer::{DeliveryBuffer, OverflowPolicy};
use tally::metric::Metric;
use tally::thread::Latch;

fn offer_drain(policy: OverflowPolicy) {
    let buffer = DeliveryBuffer::new("outputs.bench", 1_000, policy);
    let cancel = Latch::new();
    for i in 0..1_000 {
        let m = Metric::new("cpu")
            .overlay_tag("host", "a")
            .field("usage", i)
            .time(i);
        buffer.offer(m, &cancel).unwrap();
    }
    while !buffer.is_empty() {
        let batch = buffer.drain(100);
        buffer.accept(batch);
    }
}

fn overflow() {
    let buffer = DeliveryBuffer::new("outputs.bench", 100, OverflowPolicy::DropOldest);
    let cancel = Latch::new();
    for i in 0..1_000 {
        buffer.offer(Metric::new("cpu").field("usage", i), &cancel).unwrap();
    }
    assert_eq!(900, buffer.stats().dropped);
}

fn requeue() {
    let buffer = DeliveryBuffer::new("outputs.bench", 1_000, OverflowPolicy::DropOldest);
    let cancel = Latch::new();
    for i in 0..1_000 {
        buffer.offer(Metric::new("cpu").field("usage", i), &cancel).unwrap();
    }
    for _ in 0..10 {
        let batch = buffer.drain(500);
        buffer.requeue(batch);
    }
}

fn benchmark(c: &mut Criterion) {
    c.bench_function("offer_drain_drop_oldest", |b| {
        b.iter(|| offer_drain(OverflowPolicy::DropOldest));
    });
    c.bench_function("offer_drain_block_producer", |b| {
        b.iter(|| offer_drain(OverflowPolicy::BlockProducer));
    });
    c.bench_function("offer_overflow", |b| {
        b.iter(|| overflow());
    });
    c.bench_function("requeue", |b| {
        b.iter(|| requeue());
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
