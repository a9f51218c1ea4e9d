use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use strand_core::{Attributes, ClassId, DocId, Tx, TxFactory};
use strand_server::{chunk_ranges, Codec, Response, DEFAULT_CHUNK_LIMIT};

const ISSUE: ClassId = ClassId::from_static("tracker:class:Issue");

fn sample_batch(count: usize) -> Vec<Tx> {
    let f = TxFactory::new(DocId::new());
    (0..count)
        .map(|i| {
            let mut attrs = Attributes::new();
            attrs.insert("title".into(), json!(format!("issue number {i}")));
            attrs.insert("description".into(), json!("<p>some text</p>".repeat(8)));
            f.create_doc(ISSUE, DocId::nil(), DocId::new(), attrs)
        })
        .collect()
}

fn bench_chunk_ranges(c: &mut Criterion) {
    c.bench_function("chunk_ranges_10k_items", |b| {
        b.iter(|| {
            black_box(chunk_ranges(
                black_box(4_000_000),
                black_box(10_000),
                DEFAULT_CHUNK_LIMIT,
            ))
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let response = Response::transactions(&sample_batch(100));
    let mut group = c.benchmark_group("encode_100_txs");
    for (name, codec) in [
        ("json", Codec::new(false, false)),
        ("binary", Codec::new(true, false)),
        ("binary_lz4", Codec::new(true, true)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| black_box(codec.encode_bytes(black_box(&response)).unwrap()))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let response = Response::transactions(&sample_batch(100));
    let mut group = c.benchmark_group("decode_100_txs");
    for (name, codec) in [
        ("json", Codec::new(false, false)),
        ("binary", Codec::new(true, false)),
        ("binary_lz4", Codec::new(true, true)),
    ] {
        let bytes = codec.encode_bytes(&response).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(codec.decode_response(black_box(&bytes)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunk_ranges, bench_encode, bench_decode);
criterion_main!(benches);
