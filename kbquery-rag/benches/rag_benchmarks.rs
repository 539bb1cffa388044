use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kbquery_core::providers::LocalEmbedder;
use kbquery_core::providers::VectorHit;
use kbquery_core::types::{Candidate, Metadata, ScoredCandidate};
use kbquery_rag::DiversitySelector;
use kbquery_rag::retriever::merge_hits;

fn pool(size: usize, with_embeddings: bool) -> Vec<ScoredCandidate> {
    let embedder = LocalEmbedder::new(256);
    (0..size)
        .map(|i| {
            let content = format!(
                "Quarter {} revenue for region {} was {} units with margin {}",
                i % 4,
                i % 7,
                100 + i,
                i % 11
            );
            let embedding = with_embeddings.then(|| embedder.embed_sync(&content));
            ScoredCandidate::new(
                Candidate {
                    id: format!("chunk-{i:04}"),
                    source_document_id: format!("doc-{}", i % 10),
                    content,
                    similarity: 1.0 - i as f32 / size as f32,
                    origin_variant: "q".into(),
                    retrieved_by: vec!["q".into()],
                    metadata: Metadata::new(),
                    embedding,
                },
                ((i * 37) % 100) as f32 / 100.0,
            )
        })
        .collect()
}

fn bench_mmr(c: &mut Criterion) {
    let selector = DiversitySelector::new(0.7);

    let embedded = pool(45, true);
    c.bench_function("mmr_select_45_embedded_budget_5", |b| {
        b.iter(|| selector.select(black_box(&embedded), 5))
    });

    let lexical = pool(45, false);
    c.bench_function("mmr_select_45_lexical_budget_5", |b| {
        b.iter(|| selector.select(black_box(&lexical), 5))
    });

    let large = pool(500, true);
    c.bench_function("mmr_select_500_embedded_budget_20", |b| {
        b.iter(|| selector.select(black_box(&large), 20))
    });
}

fn bench_merge(c: &mut Criterion) {
    let variant_hits: Vec<Vec<VectorHit>> = (0..5)
        .map(|v| {
            (0..15)
                .map(|i| VectorHit {
                    item_id: format!("chunk-{}", (i + v * 3) % 40),
                    document_id: "doc".into(),
                    similarity: 1.0 - i as f32 / 15.0,
                    content: format!("content {i}"),
                    metadata: Metadata::new(),
                    vector: None,
                })
                .collect()
        })
        .collect();
    let names = ["q0", "q1", "q2", "q3", "q4"];

    c.bench_function("merge_hits_5x15", |b| {
        b.iter(|| {
            let per_variant = names
                .iter()
                .copied()
                .zip(variant_hits.iter().cloned())
                .collect();
            merge_hits(black_box(per_variant))
        })
    });
}

criterion_group!(benches, bench_mmr, bench_merge);
criterion_main!(benches);
