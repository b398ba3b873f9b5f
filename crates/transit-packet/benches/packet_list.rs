use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use transit_packet::{Packet, PacketList};

/// Benchmark packet construction and exclusive mutation.
fn bench_packet(c: &mut Criterion) {
    let payload = vec![0xABu8; 1200];

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Elements(1));

    group.bench_function("new_1500", |b| {
        b.iter(|| black_box(Packet::new(1500)));
    });

    group.bench_function("with_data_1200", |b| {
        b.iter(|| black_box(Packet::with_data(black_box(&payload))));
    });

    group.bench_function("set_data_1200", |b| {
        let mut pkt = Packet::new(1500);
        b.iter(|| pkt.set_data(black_box(&payload)).unwrap());
    });

    group.bench_function("duplicate", |b| {
        let pkt = Packet::with_data(&payload);
        b.iter(|| black_box(pkt.duplicate()));
    });

    group.finish();
}

/// Benchmark the list hot path: append a batch, then drain it.
fn bench_list(c: &mut Criterion) {
    let pkts: Vec<Packet> = (0..64).map(|_| Packet::new(1500)).collect();

    let mut group = c.benchmark_group("packet_list");
    group.throughput(Throughput::Elements(pkts.len() as u64));

    group.bench_function("add_last_flush_64", |b| {
        let mut list = PacketList::new();
        b.iter(|| {
            for p in &pkts {
                list.add_last(p).unwrap();
            }
            list.flush();
        });
    });

    group.bench_function("add_last_pop_64", |b| {
        let mut list = PacketList::new();
        b.iter(|| {
            for p in &pkts {
                list.add_last(p).unwrap();
            }
            while let Some(p) = list.pop_first() {
                black_box(p);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_packet, bench_list);
criterion_main!(benches);
