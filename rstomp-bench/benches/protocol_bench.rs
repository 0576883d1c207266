//! Frame encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rstomp_protocol::headers::{escape, unescape};
use rstomp_protocol::{Command, Decoder, Encoder, Frame, Headers, Heartbeat};

fn create_send_frame(body_size: usize, with_length: bool) -> Frame {
    let mut headers = Headers::new();
    headers.add("destination", "/queue/bench");
    headers.add("content-type", "text/plain");
    headers.add("x-correlation", "bench:1\nline");
    if with_length {
        headers.add("content-length", body_size.to_string());
    }
    Frame::try_new(
        Command::Send,
        headers,
        Some(Bytes::from("x".repeat(body_size))),
    )
    .unwrap()
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = create_send_frame(size, true);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(Encoder::encode_frame(frame, false)));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        for (label, with_length) in [("content_length", true), ("nul_scan", false)] {
            let encoded = Encoder::encode_frame(&create_send_frame(size, with_length), false);

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(label, size), &encoded, |b, encoded| {
                b.iter(|| {
                    let mut decoder = Decoder::new();
                    decoder.extend(encoded);
                    black_box(decoder.decode_frame().unwrap())
                });
            });
        }
    }

    group.finish();
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_decode");

    // 100 frames delivered in fixed-size chunks, as a socket would
    let mut stream = Vec::new();
    for _ in 0..100 {
        stream.extend_from_slice(&Encoder::encode_frame(&create_send_frame(256, true), false));
        stream.extend_from_slice(Encoder::encode_heartbeat());
    }

    for chunk in [16, 512, 8192] {
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                for piece in stream.chunks(chunk) {
                    decoder.extend(piece);
                    while let Some(item) = decoder.decode().unwrap() {
                        black_box(item);
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_header_escaping(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_escaping");
    let plain = "a-plain-header-value-without-specials";
    let special = "key:value\nwith\\backslash\rand:more";
    let escaped = escape(special, Command::Message).into_owned();

    group.bench_function("escape_plain", |b| {
        b.iter(|| black_box(escape(black_box(plain), Command::Message)));
    });
    group.bench_function("escape_special", |b| {
        b.iter(|| black_box(escape(black_box(special), Command::Message)));
    });
    group.bench_function("unescape_special", |b| {
        b.iter(|| black_box(unescape(black_box(&escaped), Command::Message).unwrap()));
    });

    group.finish();
}

fn bench_heartbeat_negotiation(c: &mut Criterion) {
    c.bench_function("heartbeat_negotiation", |b| {
        b.iter(|| {
            let local = Heartbeat::parse(Some(black_box("10000,10000"))).unwrap();
            let remote = Heartbeat::parse(Some(black_box("5000,20000"))).unwrap();
            black_box((
                Heartbeat::compute_ping_period(&local, &remote),
                Heartbeat::compute_pong_period(&local, &remote),
            ))
        });
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_chunked_decode,
    bench_header_escaping,
    bench_heartbeat_negotiation,
);

criterion_main!(benches);
