use crate::{CatalogError, CatalogRecord, CatalogSnapshot, Result, SnapshotMetadata, SyncCheckpoint};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Logical records kept in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Snapshot,
    SnapshotMeta,
    SyncCheckpoint,
    /// Journaled page `n` of the in-progress run.
    SyncPage(u32),
}

impl StoreKey {
    pub fn name(&self) -> String {
        match self {
            StoreKey::Snapshot => "snapshot".into(),
            StoreKey::SnapshotMeta => "snapshotMeta".into(),
            StoreKey::SyncCheckpoint => "syncCheckpoint".into(),
            StoreKey::SyncPage(n) => format!("syncPage/{n:08}"),
        }
    }
}

/// Durable key/value persistence used by the synchronizer and the index.
///
/// Implementations must surface failed writes as errors: a swallowed write
/// silently breaks resume after a crash.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: StoreKey, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: StoreKey) -> Result<()>;
    /// Apply every write or none of them. `None` removes the key.
    fn apply(&self, writes: Vec<(StoreKey, Option<Vec<u8>>)>) -> Result<()>;
}

/// sled-backed store. Every write is flushed before returning.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref()).map_err(|e| CatalogError::Storage(e.to_string()))?;
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }
}

impl CheckpointStore for SledStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.name())?.map(|v| v.to_vec()))
    }

    fn set(&self, key: StoreKey, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.name(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn delete(&self, key: StoreKey) -> Result<()> {
        self.db.remove(key.name())?;
        self.db.flush()?;
        Ok(())
    }

    fn apply(&self, writes: Vec<(StoreKey, Option<Vec<u8>>)>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in writes {
            let name = key.name();
            match value {
                Some(v) => batch.insert(name.as_bytes(), v),
                None => batch.remove(name.as_bytes()),
            }
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}

/// Process-local store, for tests and for embedding without a data dir.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.entries.lock().contains_key(&key)
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&key).cloned())
    }

    fn set(&self, key: StoreKey, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: StoreKey) -> Result<()> {
        self.entries.lock().remove(&key);
        Ok(())
    }

    fn apply(&self, writes: Vec<(StoreKey, Option<Vec<u8>>)>) -> Result<()> {
        let mut entries = self.entries.lock();
        for (key, value) in writes {
            match value {
                Some(v) => { entries.insert(key, v); }
                None => { entries.remove(&key); }
            }
        }
        Ok(())
    }
}

pub fn load_checkpoint<S: CheckpointStore + ?Sized>(store: &S) -> Result<Option<SyncCheckpoint>> {
    match store.get(StoreKey::SyncCheckpoint)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn save_checkpoint<S: CheckpointStore + ?Sized>(store: &S, checkpoint: &SyncCheckpoint) -> Result<()> {
    store.set(StoreKey::SyncCheckpoint, bincode::serialize(checkpoint)?)
}

/// Write one fetched page and the checkpoint that covers it in a single batch.
pub fn journal_page<S: CheckpointStore + ?Sized>(
    store: &S,
    page_no: u32,
    page: &[CatalogRecord],
    checkpoint: &SyncCheckpoint,
) -> Result<()> {
    store.apply(vec![
        (StoreKey::SyncPage(page_no), Some(bincode::serialize(page)?)),
        (StoreKey::SyncCheckpoint, Some(bincode::serialize(checkpoint)?)),
    ])
}

/// Reassemble the accumulator of an interrupted run from its page journal.
pub fn load_journal<S: CheckpointStore + ?Sized>(store: &S, pages: u32) -> Result<Vec<CatalogRecord>> {
    let mut records = Vec::new();
    for page_no in 0..pages {
        let bytes = store
            .get(StoreKey::SyncPage(page_no))?
            .ok_or_else(|| CatalogError::Storage(format!("journal page {page_no} missing")))?;
        let page: Vec<CatalogRecord> = bincode::deserialize(&bytes)?;
        records.extend(page);
    }
    Ok(records)
}

pub fn load_snapshot<S: CheckpointStore + ?Sized>(store: &S) -> Result<Option<CatalogSnapshot>> {
    match store.get(StoreKey::Snapshot)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn load_meta<S: CheckpointStore + ?Sized>(store: &S) -> Result<Option<SnapshotMetadata>> {
    match store.get(StoreKey::SnapshotMeta)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Replace the snapshot and its metadata, and drop the run's checkpoint and
/// journal, all in one batch.
pub fn commit_snapshot<S: CheckpointStore + ?Sized>(
    store: &S,
    snapshot: &[CatalogRecord],
    meta: &SnapshotMetadata,
    journaled_pages: u32,
) -> Result<()> {
    let mut writes = vec![
        (StoreKey::Snapshot, Some(bincode::serialize(snapshot)?)),
        (StoreKey::SnapshotMeta, Some(serde_json::to_vec_pretty(meta)?)),
        (StoreKey::SyncCheckpoint, None),
    ];
    writes.extend((0..journaled_pages).map(|n| (StoreKey::SyncPage(n), None)));
    store.apply(writes)
}

/// Forget an in-progress run: checkpoint plus journal.
pub fn discard_run<S: CheckpointStore + ?Sized>(store: &S, journaled_pages: u32) -> Result<()> {
    let mut writes = vec![(StoreKey::SyncCheckpoint, None)];
    writes.extend((0..journaled_pages).map(|n| (StoreKey::SyncPage(n), None)));
    store.apply(writes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> CatalogRecord {
        CatalogRecord {
            id: id.into(),
            name: format!("name-{id}"),
            members: 1,
            category: String::new(),
            region: String::new(),
            activity_24h: 0.0,
            volume_24h: 0.0,
            gained_24h: 0.0,
            lost_24h: 0.0,
            share_value: 0.0,
        }
    }

    #[test]
    fn commit_clears_checkpoint_and_journal() {
        let store = MemoryStore::new();
        let cp = SyncCheckpoint { offset: 2, timestamp_ms: 1, pages: 1 };
        journal_page(&store, 0, &[record("a"), record("b")], &cp).unwrap();
        assert_eq!(load_checkpoint(&store).unwrap(), Some(cp));
        assert_eq!(load_journal(&store, 1).unwrap().len(), 2);

        let meta = SnapshotMetadata { count: 2, timestamp_ms: 1, human_date: String::new() };
        commit_snapshot(&store, &[record("a"), record("b")], &meta, 1).unwrap();
        assert!(load_checkpoint(&store).unwrap().is_none());
        assert!(!store.contains(StoreKey::SyncPage(0)));
        assert_eq!(load_meta(&store).unwrap(), Some(meta));
        assert_eq!(load_snapshot(&store).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn missing_journal_page_is_a_storage_error() {
        let store = MemoryStore::new();
        assert!(matches!(load_journal(&store, 1), Err(CatalogError::Storage(_))));
    }

    #[test]
    fn sled_store_round_trips_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        save_checkpoint(&store, &SyncCheckpoint { offset: 50, timestamp_ms: 7, pages: 1 }).unwrap();
        assert_eq!(load_checkpoint(&store).unwrap().map(|c| c.offset), Some(50));
        store.delete(StoreKey::SyncCheckpoint).unwrap();
        assert!(load_checkpoint(&store).unwrap().is_none());
    }
}
