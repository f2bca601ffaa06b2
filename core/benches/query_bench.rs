use catalog_core::{CatalogRecord, MemoryStore, NumericField, NumericFilters, SearchIndex};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn catalog(n: usize) -> Vec<CatalogRecord> {
    (0..n)
        .map(|i| CatalogRecord {
            id: i.to_string(),
            name: format!("Group {:05} {}", (i * 7919) % n, if i % 3 == 0 { "North" } else { "South" }),
            members: (i % 100) as u64,
            category: String::new(),
            region: String::new(),
            activity_24h: (i % 17) as f64,
            volume_24h: (i % 1000) as f64,
            gained_24h: 0.0,
            lost_24h: 0.0,
            share_value: 1.0,
        })
        .collect()
}

fn bench_query(c: &mut Criterion) {
    let index = SearchIndex::new(Arc::new(MemoryStore::new()));
    index.replace(catalog(20_000));
    let filters = NumericFilters::new().min(NumericField::Members, 50.0);
    c.bench_function("query_text_and_members", |b| b.iter(|| index.query("north", &filters)));
    c.bench_function("query_unfiltered", |b| b.iter(|| index.query("", &NumericFilters::new())));
}

criterion_group!(benches, bench_query);
criterion_main!(benches);
