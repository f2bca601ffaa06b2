use catalog_core::{
    BoundedResultPager, CatalogRecord, MemoryStore, NumericField, NumericFilters, PagerConfig, Remaining, SearchIndex,
};
use std::sync::Arc;

fn catalog() -> Vec<CatalogRecord> {
    (1..=30u64)
        .map(|i| CatalogRecord {
            id: format!("r{i}"),
            name: format!("Record {i:02}"),
            members: i,
            category: "guild".into(),
            region: "eu".into(),
            activity_24h: (i % 7) as f64,
            volume_24h: (i * 10) as f64,
            gained_24h: (i % 5) as f64,
            lost_24h: (30 - i) as f64,
            share_value: i as f64 / 4.0,
        })
        .collect()
}

fn index() -> SearchIndex<MemoryStore> {
    let idx = SearchIndex::new(Arc::new(MemoryStore::new()));
    idx.replace(catalog());
    idx
}

#[test]
fn each_bound_selects_exactly_its_subset() {
    let idx = index();
    let all = catalog();
    for field in NumericField::ALL {
        for threshold in [1.0, 3.0, 7.5, 150.0] {
            let got: Vec<String> = idx.query("", &NumericFilters::new().min(field, threshold)).into_iter().map(|r| r.id).collect();
            let mut want: Vec<&CatalogRecord> = all.iter().filter(|r| field.value(r) >= threshold).collect();
            want.sort_by(|a, b| a.name.cmp(&b.name));
            let want: Vec<String> = want.into_iter().map(|r| r.id.clone()).collect();
            assert_eq!(got, want, "min {} >= {threshold}", field.name());

            let got = idx.query("", &NumericFilters::new().max(field, threshold));
            assert!(got.iter().all(|r| field.value(r) <= threshold), "max {}", field.name());
            assert_eq!(got.len(), all.iter().filter(|r| field.value(r) <= threshold).count());
        }
    }
}

#[test]
fn zero_bounds_are_ignored() {
    let idx = index();
    let f = NumericFilters::new().min(NumericField::Members, 0.0).max(NumericField::Volume24h, 0.0);
    assert!(f.is_empty());
    assert_eq!(idx.query("", &f).len(), 30);
}

#[test]
fn text_and_numeric_filters_combine() {
    let idx = index();
    let f = NumericFilters::new().min(NumericField::Members, 10.0).max(NumericField::Members, 19.0);
    let out: Vec<String> = idx.query("record 1", &f).into_iter().map(|r| r.name).collect();
    assert_eq!(out.len(), 10);
    assert_eq!(out.first().map(String::as_str), Some("Record 10"));
}

#[test]
fn pager_over_query_results() {
    let idx = index();
    let mut pager = BoundedResultPager::new(PagerConfig { page_size: 10, max_working_set: 25 });
    pager.reset(idx.query("", &NumericFilters::new()));
    let mut seen = 0;
    loop {
        let reveal = pager.reveal_next();
        seen += reveal.batch.len();
        if reveal.remaining != Remaining::More {
            assert_eq!(reveal.remaining, Remaining::CappedMore);
            break;
        }
    }
    assert_eq!(seen, 25);
    assert_eq!(pager.total(), 30);
}
