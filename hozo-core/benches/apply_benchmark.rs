use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hozo_core::{apply, Concept, IsaEdge, OntologyDocument, Operation, Point};

fn populated_doc(concepts: usize) -> OntologyDocument {
    let mut doc = OntologyDocument::new("bench.xml", "bench");
    for i in 0..concepts {
        doc.concepts.push(Concept::new(
            format!("c{i}"),
            format!("Concept {i}"),
            Point::new(i as f64, i as f64),
        ));
        if i > 0 {
            doc.isa_links.push(IsaEdge::new(format!("e{i}"), "c0", format!("c{i}")));
        }
    }
    doc
}

fn bench_move_concept(c: &mut Criterion) {
    let mut doc = populated_doc(1_000);
    let op = Operation::move_concept("c500", Point::new(10.0, 20.0));

    c.bench_function("apply_move_1k_concepts", |b| {
        b.iter(|| black_box(apply(&mut doc, black_box(&op))))
    });
}

fn bench_delete_cascade(c: &mut Criterion) {
    let doc = populated_doc(1_000);
    let op = Operation::delete_concept("c0");

    c.bench_function("apply_delete_root_cascade_1k", |b| {
        b.iter_batched(
            || doc.clone(),
            |mut d| black_box(apply(&mut d, &op)),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let raw = r#"{"type":"update-concept","conceptId":"c42","changes":{"label":"Renamed"}}"#;

    c.bench_function("operation_decode_json", |b| {
        b.iter(|| black_box(serde_json::from_str::<Operation>(black_box(raw)).unwrap()))
    });
}

criterion_group!(benches, bench_move_concept, bench_delete_cascade, bench_operation_decode);
criterion_main!(benches);
