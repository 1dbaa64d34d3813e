//! Benchmarks for rank fusion and filter compilation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pgvecs::hybrid::rrf_fuse;
use pgvecs::Filter;
use rand::seq::SliceRandom;
use serde_json::json;
use uuid::Uuid;

fn ranked_lists(n: usize) -> (Vec<Uuid>, Vec<Uuid>) {
    let ids: Vec<Uuid> = (0..n * 2).map(|_| Uuid::new_v4()).collect();
    let mut rng = rand::thread_rng();
    let mut lexical: Vec<Uuid> = ids[..n + n / 2].to_vec();
    let mut semantic: Vec<Uuid> = ids[n / 2..].to_vec();
    lexical.shuffle(&mut rng);
    semantic.shuffle(&mut rng);
    lexical.truncate(n);
    semantic.truncate(n);
    (lexical, semantic)
}

fn benchmark_rrf_fuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("rrf_fuse");

    for size in [10, 60, 1000].iter() {
        let (lexical, semantic) = ranked_lists(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                rrf_fuse(
                    black_box(&lexical),
                    black_box(&semantic),
                    1.0,
                    5.0,
                    50.0,
                    size.min(30),
                )
            });
        });
    }

    group.finish();
}

fn benchmark_filter_compile(c: &mut Criterion) {
    let expr = json!({
        "document_id": {"$in": [Uuid::new_v4().to_string(), Uuid::new_v4().to_string()]},
        "$or": [
            {"topic": "rust", "year": {"$gte": 2020}},
            {"author.name": {"$nin": ["a", "b", "c"]}},
        ],
        "group_ids": Uuid::new_v4().to_string(),
    });

    c.bench_function("filter_compile", |b| {
        b.iter(|| Filter::compile(black_box(&expr)).unwrap())
    });
}

criterion_group!(benches, benchmark_rrf_fuse, benchmark_filter_compile);
criterion_main!(benches);
