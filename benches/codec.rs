use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mead::recv_buffer::ReceiveBuffer;
use mead::{Segment, DEFAULT_MTU};

/// 세그먼트 인코딩 (헤더 + CRC32)
fn bench_encode(c: &mut Criterion) {
    let segment = Segment::data(42, Bytes::from(vec![0xABu8; DEFAULT_MTU])).with_ack(7, 1 << 20, 0b101);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(segment.encoded_len() as u64));

    group.bench_function("encode_mtu_segment", |b| {
        b.iter(|| black_box(&segment).encode());
    });

    let wire = segment.encode();
    group.bench_function("decode_mtu_segment", |b| {
        b.iter(|| Segment::decode(black_box(&wire)).unwrap());
    });

    group.finish();
}

/// 순서 밖 도착 세그먼트 재정렬
fn bench_reorder(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; DEFAULT_MTU]);

    let mut group = c.benchmark_group("recv_buffer");
    group.throughput(Throughput::Elements(64));

    group.bench_function("reorder_64_reversed", |b| {
        b.iter(|| {
            let mut buffer = ReceiveBuffer::new(8 * 1024 * 1024, 0);
            for seq in (1..=64u32).rev() {
                buffer.accept(seq, payload.clone(), false);
            }
            black_box(buffer.read(usize::MAX));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_reorder);
criterion_main!(benches);
