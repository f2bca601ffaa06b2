//! In-memory filtering and sorting over the last completed snapshot.
//!
//! The working copy is sorted once when it is installed and swapped by
//! reference, so queries never scan the durable store and never see a
//! half-built copy.

use crate::persist::{load_snapshot, CheckpointStore};
use crate::{CatalogRecord, CatalogSnapshot, Result};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Shorter text queries match nearly everything, so they do not filter.
pub const MIN_TEXT_QUERY_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericField {
    Members,
    Activity24h,
    Volume24h,
    Gained24h,
    Lost24h,
    ShareValue,
}

impl NumericField {
    pub const ALL: [NumericField; 6] = [
        NumericField::Members,
        NumericField::Activity24h,
        NumericField::Volume24h,
        NumericField::Gained24h,
        NumericField::Lost24h,
        NumericField::ShareValue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NumericField::Members => "members",
            NumericField::Activity24h => "activity_24h",
            NumericField::Volume24h => "volume_24h",
            NumericField::Gained24h => "gained_24h",
            NumericField::Lost24h => "lost_24h",
            NumericField::ShareValue => "share_value",
        }
    }

    pub fn value(self, r: &CatalogRecord) -> f64 {
        match self {
            NumericField::Members => r.members as f64,
            NumericField::Activity24h => r.activity_24h,
            NumericField::Volume24h => r.volume_24h,
            NumericField::Gained24h => r.gained_24h,
            NumericField::Lost24h => r.lost_24h,
            NumericField::ShareValue => r.share_value,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bound {
    min: f64,
    max: f64,
}

/// Per-field inclusive ranges. A bound of zero (or below) is "not supplied".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumericFilters {
    bounds: [Bound; 6],
}

impl NumericFilters {
    pub fn new() -> Self { Self::default() }

    pub fn min(mut self, field: NumericField, value: f64) -> Self {
        self.set_min(field, value);
        self
    }

    pub fn max(mut self, field: NumericField, value: f64) -> Self {
        self.set_max(field, value);
        self
    }

    pub fn set_min(&mut self, field: NumericField, value: f64) {
        self.bounds[field.slot()].min = value;
    }

    pub fn set_max(&mut self, field: NumericField, value: f64) {
        self.bounds[field.slot()].max = value;
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.iter().all(|b| b.min <= 0.0 && b.max <= 0.0)
    }

    pub fn matches(&self, r: &CatalogRecord) -> bool {
        NumericField::ALL.iter().all(|&field| {
            let b = self.bounds[field.slot()];
            let v = field.value(r);
            (b.min <= 0.0 || v >= b.min) && (b.max <= 0.0 || v <= b.max)
        })
    }
}

struct Entry {
    record: CatalogRecord,
    folded: String,
    collation: String,
}

/// Sort key approximating locale ordering: accents stripped, case folded.
fn collation_key(name: &str) -> String {
    name.nfkd().filter(|c| !is_combining_mark(*c)).flat_map(char::to_lowercase).collect()
}

fn compare_entries(a: &Entry, b: &Entry) -> Ordering {
    a.collation
        .cmp(&b.collation)
        .then_with(|| a.record.name.cmp(&b.record.name))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

pub struct SearchIndex<St> {
    store: Arc<St>,
    working: RwLock<Option<Arc<Vec<Entry>>>>,
    /// Bumped by every `replace`; a store load only installs its copy if no
    /// replace landed while it was reading.
    generation: AtomicU64,
}

fn build_entries(snapshot: CatalogSnapshot) -> Arc<Vec<Entry>> {
    let mut entries: Vec<Entry> = snapshot
        .into_iter()
        .map(|record| Entry {
            folded: record.name.to_lowercase(),
            collation: collation_key(&record.name),
            record,
        })
        .collect();
    entries.sort_by(compare_entries);
    Arc::new(entries)
}

impl<St: CheckpointStore> SearchIndex<St> {
    pub fn new(store: Arc<St>) -> Self {
        Self { store, working: RwLock::new(None), generation: AtomicU64::new(0) }
    }

    /// Install a new working copy wholesale. Always wins over a load that
    /// is still reading the store.
    pub fn replace(&self, snapshot: CatalogSnapshot) {
        let entries = build_entries(snapshot);
        let mut working = self.working.write();
        self.generation.fetch_add(1, AtomicOrdering::AcqRel);
        *working = Some(entries);
    }

    /// Re-read the snapshot from the store. A missing snapshot loads as
    /// empty. Returns the size of the working copy afterwards, which is the
    /// newer one if a `replace` happened during the read.
    pub fn load(&self) -> Result<usize> {
        Ok(self.load_from_store()?.len())
    }

    fn load_from_store(&self) -> Result<Arc<Vec<Entry>>> {
        let seen = self.generation.load(AtomicOrdering::Acquire);
        let snapshot = load_snapshot(self.store.as_ref())?.unwrap_or_default();
        let entries = build_entries(snapshot);

        let mut working = self.working.write();
        if self.generation.load(AtomicOrdering::Acquire) != seen {
            if let Some(newer) = working.as_ref() {
                debug!("search index replaced during load, keeping the newer copy");
                return Ok(newer.clone());
            }
        }
        *working = Some(entries.clone());
        debug!(records = entries.len(), "search index loaded from store");
        Ok(entries)
    }

    /// Load the working copy from the store if it is not in memory yet.
    /// Callers that must tell a failed load from an empty catalog call this
    /// before querying.
    pub fn ensure_loaded(&self) -> Result<()> {
        self.try_working().map(|_| ())
    }

    pub fn is_loaded(&self) -> bool {
        self.working.read().is_some()
    }

    fn try_working(&self) -> Result<Arc<Vec<Entry>>> {
        if let Some(w) = self.working.read().as_ref() {
            return Ok(w.clone());
        }
        self.load_from_store()
    }

    fn working(&self) -> Arc<Vec<Entry>> {
        self.try_working().unwrap_or_else(|e| {
            warn!(error = %e, "cold-start load of search index failed");
            Arc::new(Vec::new())
        })
    }

    /// Filter by name substring and numeric ranges, sorted by name.
    /// The returned Vec is the caller's to keep.
    pub fn query(&self, text: &str, filters: &NumericFilters) -> Vec<CatalogRecord> {
        let working = self.working();
        let needle = text.trim().to_lowercase();
        let text_filter = needle.chars().count() >= MIN_TEXT_QUERY_CHARS;
        let numeric_filter = !filters.is_empty();

        working
            .iter()
            .filter(|e| !text_filter || e.folded.contains(&needle))
            .filter(|e| !numeric_filter || filters.matches(&e.record))
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<CatalogRecord> {
        self.working().iter().find(|e| e.record.id == id).map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.working().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn rec(id: &str, name: &str, members: u64) -> CatalogRecord {
        CatalogRecord {
            id: id.into(),
            name: name.into(),
            members,
            category: String::new(),
            region: String::new(),
            activity_24h: 0.0,
            volume_24h: 0.0,
            gained_24h: 0.0,
            lost_24h: 0.0,
            share_value: 0.0,
        }
    }

    fn index(records: Vec<CatalogRecord>) -> SearchIndex<MemoryStore> {
        let idx = SearchIndex::new(Arc::new(MemoryStore::new()));
        idx.replace(records);
        idx
    }

    fn names(v: &[CatalogRecord]) -> Vec<&str> {
        v.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn min_members_example() {
        let idx = index(vec![rec("1", "Zeta", 5), rec("2", "Alpha", 12), rec("3", "Mid", 12)]);
        let out = idx.query("", &NumericFilters::new().min(NumericField::Members, 10.0));
        assert_eq!(names(&out), vec!["Alpha", "Mid"]);
    }

    #[test]
    fn single_char_does_not_filter() {
        let idx = index(vec![rec("1", "Zeta", 5), rec("2", "Alpha", 12)]);
        let none = NumericFilters::new();
        assert_eq!(idx.query("q", &none), idx.query("", &none));
        assert_eq!(idx.query("q", &none).len(), 2);
    }

    #[test]
    fn text_match_is_case_insensitive_substring() {
        let idx = index(vec![
            rec("1", "Northern Lights", 1),
            rec("2", "Southern Cross", 1),
            rec("3", "Eastside", 1),
        ]);
        let out = idx.query("HERN", &NumericFilters::new());
        assert_eq!(names(&out), vec!["Northern Lights", "Southern Cross"]);
    }

    #[test]
    fn sort_ignores_case_and_accents() {
        let idx = index(vec![
            rec("1", "beta", 1),
            rec("2", "Émile", 1),
            rec("3", "Alpha", 1),
            rec("4", "zulu", 1),
        ]);
        let out = idx.query("", &NumericFilters::new());
        assert_eq!(names(&out), vec!["Alpha", "beta", "Émile", "zulu"]);
    }

    #[test]
    fn equal_min_and_max_is_exact_match() {
        let idx = index(vec![rec("1", "a1", 9), rec("2", "a2", 10), rec("3", "a3", 11)]);
        let f = NumericFilters::new()
            .min(NumericField::Members, 10.0)
            .max(NumericField::Members, 10.0);
        assert_eq!(names(&idx.query("", &f)), vec!["a2"]);
    }

    #[test]
    fn bounds_combine_conjunctively() {
        let mut a = rec("1", "a", 20);
        a.volume_24h = 5.0;
        let mut b = rec("2", "b", 20);
        b.volume_24h = 50.0;
        let c = rec("3", "c", 2);
        let idx = index(vec![a, b, c]);
        let f = NumericFilters::new()
            .min(NumericField::Members, 10.0)
            .max(NumericField::Volume24h, 10.0);
        assert_eq!(names(&idx.query("", &f)), vec!["a"]);
    }

    #[test]
    fn results_are_independent_of_working_copy() {
        let idx = index(vec![rec("1", "Alpha", 1)]);
        let mut out = idx.query("", &NumericFilters::new());
        out.clear();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn cold_start_with_empty_store_is_empty() {
        let idx: SearchIndex<MemoryStore> = SearchIndex::new(Arc::new(MemoryStore::new()));
        assert!(!idx.is_loaded());
        assert!(idx.query("", &NumericFilters::new()).is_empty());
        assert!(idx.is_loaded());
    }

    #[test]
    fn explicit_load_rereads_the_store() {
        let store = Arc::new(MemoryStore::new());
        let stored = [rec("1", "stored", 1)];
        crate::persist::commit_snapshot(store.as_ref(), &stored, &meta(1), 0).unwrap();
        let idx = SearchIndex::new(store);
        idx.replace(vec![rec("1", "a", 1), rec("2", "b", 1)]);
        assert_eq!(idx.load().unwrap(), 1);
        assert_eq!(names(&idx.query("", &NumericFilters::new())), vec!["stored"]);
    }

    #[test]
    fn ensure_loaded_reports_store_failures() {
        let store = Arc::new(MemoryStore::new());
        store.set(crate::StoreKey::Snapshot, b"not bincode".to_vec()).unwrap();
        let idx = SearchIndex::new(store);
        assert!(idx.ensure_loaded().is_err());
        assert!(!idx.is_loaded());
    }

    fn meta(count: usize) -> crate::SnapshotMetadata {
        crate::SnapshotMetadata { count, timestamp_ms: 0, human_date: String::new() }
    }
}
