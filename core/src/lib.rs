use serde::{Deserialize, Serialize};

pub mod error;
pub mod pager;
pub mod persist;
pub mod search;
pub mod source;
pub mod sync;

pub use error::{CatalogError, Result, SourceError};
pub use pager::{BoundedResultPager, PagerConfig, Remaining, Reveal};
pub use persist::{CheckpointStore, MemoryStore, SledStore, StoreKey};
pub use search::{NumericField, NumericFilters, SearchIndex};
pub use source::{with_retry, Backoff, HttpPageSource, PageSource, RetryingSource};
pub use sync::{sync_health, CatalogSynchronizer, SyncConfig, SyncHealth, SyncOutcome};

/// The completed catalog as of the last successful sync.
pub type CatalogSnapshot = Vec<CatalogRecord>;

/// One cataloged entity as held in the snapshot and served by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
    pub name: String,
    pub members: u64,
    pub category: String,
    pub region: String,
    pub activity_24h: f64,
    pub volume_24h: f64,
    pub gained_24h: f64,
    pub lost_24h: f64,
    /// Derived value per member share, as reported by the source.
    pub share_value: f64,
}

/// Record shape as returned by the paginated source. Everything except the
/// identity is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Option<u64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub stats_24h: Option<RawStats>,
    #[serde(default)]
    pub share_value: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStats {
    #[serde(default)]
    pub activity: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub gained: Option<f64>,
    #[serde(default)]
    pub lost: Option<f64>,
}

impl RawRecord {
    /// Project into a `CatalogRecord`, defaulting absent fields to zero/empty.
    /// Returns `None` for records without an id or a name.
    pub fn into_record(self) -> Option<CatalogRecord> {
        let id = self.id.trim().to_string();
        let name = self.name.trim().to_string();
        if id.is_empty() || name.is_empty() {
            return None;
        }
        let stats = self.stats_24h.unwrap_or_default();
        Some(CatalogRecord {
            id,
            name,
            members: self.members.unwrap_or(0),
            category: self.category.unwrap_or_default(),
            region: self.region.unwrap_or_default(),
            activity_24h: stats.activity.unwrap_or(0.0),
            volume_24h: stats.volume.unwrap_or(0.0),
            gained_24h: stats.gained.unwrap_or(0.0),
            lost_24h: stats.lost.unwrap_or(0.0),
            share_value: self.share_value.unwrap_or(0.0),
        })
    }
}

// Sources disagree on whether ids are strings or numbers.
fn id_from_any<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(de)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Progress marker of an in-flight sync: fetching resumes at `offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub offset: u64,
    /// Unix milliseconds of the last successful page.
    pub timestamp_ms: i64,
    /// Number of journaled pages belonging to this run.
    pub pages: u32,
}

/// Describes the last completed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub count: usize,
    pub timestamp_ms: i64,
    pub human_date: String,
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn human_date(ts_ms: i64) -> String {
    let fmt = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
    );
    time::OffsetDateTime::from_unix_timestamp_nanos(ts_ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(fmt).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_missing_fields_to_defaults() {
        let json = r#"{"id": 42, "name": " Alpha ", "stats_24h": {"volume": 3.5}}"#;
        let raw: RawRecord = serde_json::from_str(json).unwrap();
        let rec = raw.into_record().unwrap();
        assert_eq!(rec.id, "42");
        assert_eq!(rec.name, "Alpha");
        assert_eq!(rec.members, 0);
        assert_eq!(rec.volume_24h, 3.5);
        assert_eq!(rec.activity_24h, 0.0);
        assert!(rec.category.is_empty());
    }

    #[test]
    fn drops_nameless_records() {
        let raw = RawRecord { id: "1".into(), ..Default::default() };
        assert!(raw.into_record().is_none());
    }

    #[test]
    fn formats_human_date() {
        assert_eq!(human_date(0), "1970-01-01 00:00:00 UTC");
    }
}
