use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use strand_core::markup::{nodes_from_collaborative, nodes_to_collaborative};
use strand_core::{class, extract_references, parse_markup, to_markup, DocId, MarkupNode};

/// A document of `paragraphs` paragraphs, each mentioning one person.
fn sample_document(paragraphs: usize) -> MarkupNode {
    let mut doc = MarkupNode::new("doc");
    for i in 0..paragraphs {
        doc = doc.with_child(
            MarkupNode::new("paragraph")
                .with_child(MarkupNode::text(format!("paragraph {i} mentions ")))
                .with_child(MarkupNode::reference(DocId::new(), &class::PERSON, "someone")),
        );
    }
    doc
}

fn bench_extract_from_markup(c: &mut Criterion) {
    let text = to_markup(&sample_document(200));

    c.bench_function("extract_markup_200_paragraphs", |b| {
        b.iter(|| {
            let root = parse_markup(black_box(&text)).unwrap();
            black_box(extract_references(&root));
        })
    });
}

fn bench_extract_from_collaborative(c: &mut Criterion) {
    let buffer = nodes_to_collaborative(&sample_document(200), "content");

    c.bench_function("extract_collaborative_200_paragraphs", |b| {
        b.iter(|| {
            let root = nodes_from_collaborative(black_box(&buffer), "content").unwrap();
            black_box(extract_references(&root));
        })
    });
}

criterion_group!(
    benches,
    bench_extract_from_markup,
    bench_extract_from_collaborative,
);
criterion_main!(benches);
