//! Throughput benchmarks for the payload codec and the packet framer.
//!
//! - **codec/pack_identity** and **codec/unpack_identity**: the 25-byte
//!   get-identity payload every client asks for right after enumerating.
//! - **codec/bool_array**: a 72-byte `576!` field, the widest bit array that
//!   fits a packet.
//! - **framing/decode_stream**: splitting a buffer of back-to-back packets.

#![allow(missing_docs)]

use brickemu_core::{Format, Packet, PacketCodec, Value};
use bytes::BytesMut;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio_util::codec::Decoder;

fn identity_values() -> Vec<Value> {
    vec![
        Value::from("EALV3"),
        Value::from("0"),
        Value::Char('?'),
        Value::from([1u8, 0, 0]),
        Value::from([2u8, 0, 0]),
        Value::U16(2131),
    ]
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let format: Format = "8s 8s c 3B 3B H".parse().unwrap_or_default();
    let values = identity_values();
    let payload = format.pack(&values).unwrap_or_default();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("pack_identity", |b| {
        b.iter(|| format.pack(black_box(&values)));
    });
    group.bench_function("unpack_identity", |b| {
        b.iter(|| format.unpack(black_box(&payload)));
    });

    let bits: Format = "576!".parse().unwrap_or_default();
    let pattern = Value::Array((0..576).map(|i| Value::Bool(i % 3 == 0)).collect());
    let packed = bits.pack(std::slice::from_ref(&pattern)).unwrap_or_default();
    group.bench_function("bool_array", |b| {
        b.iter(|| bits.unpack(black_box(&packed)));
    });

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let mut stream = BytesMut::new();
    for seq in 1..=15u8 {
        if let Ok(packet) = Packet::new(436_811_748, 1, seq, true, &[seq; 16]) {
            stream.extend_from_slice(packet.as_bytes());
        }
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("decode_stream", |b| {
        b.iter(|| {
            let mut codec = PacketCodec::client();
            let mut buf = stream.clone();
            let mut count = 0usize;
            while let Ok(Some(packet)) = codec.decode(&mut buf) {
                count += black_box(packet).length();
            }
            count
        });
    });

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .with_output_color(true)
        .significance_level(0.05);
    targets = bench_codec, bench_framing
);
criterion_main!(benches);
