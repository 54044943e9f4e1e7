// Criterion benchmarks for the minirpc-common codec and framing layers
//
// Run benchmarks with:
//   cargo bench -p minirpc-common
//
// For detailed output with plots:
//   cargo bench -p minirpc-common -- --save-baseline main

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use minirpc_common::{codec, write_frame, Frame, FrameCodec, FrameHeader};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Serialize, Deserialize)]
struct ColorReply {
    count: u32,
    names: Vec<String>,
    weights: Vec<f64>,
}

fn reply(entries: usize) -> ColorReply {
    ColorReply {
        count: entries as u32,
        names: (0..entries).map(|i| format!("color-{}", i)).collect(),
        weights: (0..entries).map(|i| i as f64 * 0.5).collect(),
    }
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for entries in [1usize, 16, 256] {
        let value = reply(entries);
        let encoded = codec::encode(&value).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", entries), &value, |b, value| {
            b.iter(|| codec::encode(black_box(value)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decode", entries), &encoded, |b, bytes| {
            b.iter(|| codec::decode::<ColorReply>(black_box(bytes)).unwrap());
        });
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    group.bench_function("write_frame_small", |b| {
        let payload = [0u8; 16];
        b.iter(|| write_frame(black_box(FrameHeader::request(3, 1)), black_box(&payload)));
    });

    // 64 back-to-back 1 KiB frames decoded from one buffer
    let mut wire = BytesMut::new();
    let mut encoder = FrameCodec::default();
    for seq in 0..64u32 {
        encoder
            .encode(Frame::new(FrameHeader::reply(3, seq), vec![7u8; 1024]), &mut wire)
            .unwrap();
    }
    let wire = wire.freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("decode_stream", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            let mut decoder = FrameCodec::default();
            let mut frames = 0;
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                black_box(frame);
                frames += 1;
            }
            frames
        });
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_framing);
criterion_main!(benches);
