//! Benchmarks for frame encoding and masking
//!
//! Covers the three length brackets (7-bit, 16-bit, 64-bit) plus a typical
//! metrics message, and an encode/decode loop through an in-memory stream.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kokoro::ws::{Opcode, WsConnection, apply_mask, encode_frame};
use std::hint::black_box;
use tokio::io::AsyncWriteExt;

const SIZES: [usize; 4] = [125, 4 * 1024, 65_535, 1024 * 1024];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for size in SIZES {
        let payload = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| encode_frame(Opcode::Text, black_box(payload), Some([1, 2, 3, 4])))
        });
    }
    group.finish();
}

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_mask");
    for size in SIZES {
        let mut payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| apply_mask(black_box(&mut payload), [9, 8, 7, 6]))
        });
    }
    group.finish();
}

fn bench_metrics_message(c: &mut Criterion) {
    let message = br#"{"type":"metrics","agent_id":"0b7c6f1e-5f0a-4c55-9d0e-3f1f2a9c8b11","seq":4242,"ts":1700000000,"metrics":{"ts":1700000000,"cpu":12.5,"mem":41.2,"disk":63.0,"swap":0.0,"bytes_up_total":123456789,"bytes_down_total":987654321,"net_up_bps":2048,"net_down_bps":8192}}"#;
    c.bench_function("metrics_message_frame", |b| {
        b.iter(|| encode_frame(Opcode::Text, black_box(message), Some(rand::random())))
    });
}

fn bench_read_loop(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let payload = vec![0x42u8; 4 * 1024];
    let frame = encode_frame(Opcode::Text, &payload, None);

    let mut group = c.benchmark_group("read_message");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("4KiB_text", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let (client, mut server) = tokio::io::duplex(64 * 1024);
                server.write_all(&frame).await.unwrap();
                let mut connection = WsConnection::new(client);
                black_box(connection.read_message().await.unwrap())
            })
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_mask, bench_metrics_message, bench_read_loop);
criterion_main!(benches);
