//! Criterion benchmark untuk Buffer dan RPC framing
//!
//! Run dengan: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use loomnet::protocol::Frame;
use loomnet::Buffer;

fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    let chunk = vec![0xabu8; 256];
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    // append lalu retrieve: compact menjaga buffer tetap kecil
    group.bench_function("append_retrieve", |b| {
        let mut buf = Buffer::new();
        b.iter(|| {
            buf.append(black_box(&chunk));
            buf.retrieve(chunk.len());
        });
    });

    group.bench_function("int_codec", |b| {
        let mut buf = Buffer::new();
        let mut i = 0i64;
        b.iter(|| {
            buf.append_i64(black_box(i));
            buf.append_i32(black_box(i as i32));
            black_box(buf.read_i64());
            black_box(buf.read_i32());
            i = i.wrapping_add(1);
        });
    });

    group.bench_function("prepend_header", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            buf.append(black_box(&chunk));
            buf.prepend_i32(chunk.len() as i32);
            black_box(buf.readable_bytes())
        });
    });

    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    for size in [64usize, 1024, 16 * 1024].iter() {
        let frame = Frame::new(42, "EchoServer", "Echo", vec![7u8; *size]);
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_function(format!("encode_{}", size), |b| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });

        // Decode batch 16 frame dari satu buffer
        group.bench_function(format!("decode_batch_{}", size), |b| {
            let mut encoded = Buffer::new();
            for _ in 0..16 {
                frame.encode_into(&mut encoded).unwrap();
            }
            let bytes = encoded.peek().to_vec();
            b.iter(|| {
                let mut buf = Buffer::with_capacity(bytes.len());
                buf.append(&bytes);
                black_box(Frame::decode_all(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_buffer, bench_frame);
criterion_main!(benches);
