//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, Frame};
use serde_json::json;

fn chat_frame() -> Frame {
    Frame::event(
        "chat message",
        json!({
            "room_id": "5b0f8f0e-5d7c-4b8e-9a53-1f0c2d7e6a11",
            "from": "Alice",
            "author_row_id": "alice",
            "content": "x".repeat(128),
            "type": "text",
        }),
    )
}

fn bench_text(c: &mut Criterion) {
    let frame = chat_frame();
    let encoded = codec::encode_text(&frame).unwrap();

    let mut group = c.benchmark_group("text");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_event", |b| {
        b.iter(|| codec::encode_text(black_box(&frame)))
    });
    group.bench_function("decode_event", |b| {
        b.iter(|| codec::decode_text(black_box(&encoded)))
    });
    group.finish();
}

fn bench_binary(c: &mut Criterion) {
    let frame = chat_frame();
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("binary");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_event", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("decode_event", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_payload(c: &mut Criterion) {
    let frames: Vec<Frame> = (0..16).map(|_| chat_frame()).collect();

    c.bench_function("polling_payload_16", |b| {
        b.iter(|| {
            let payload = codec::encode_payload(black_box(&frames)).unwrap();
            codec::decode_payload(black_box(&payload)).unwrap()
        })
    });
}

criterion_group!(benches, bench_text, bench_binary, bench_payload);
criterion_main!(benches);
