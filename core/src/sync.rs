//! Resumable bulk transfer of the remote catalog into the durable snapshot.
//!
//! Pages are fetched strictly in offset order. After each page the page
//! itself and the checkpoint covering it are written in one batch, so an
//! interrupted run resumes with exactly the records it had already fetched.
//! On completion the snapshot, its metadata and the removal of the run's
//! checkpoint and journal are committed together.

use crate::persist::{
    commit_snapshot, discard_run, journal_page, load_checkpoint, load_journal, load_meta,
    save_checkpoint, CheckpointStore,
};
use crate::search::SearchIndex;
use crate::source::PageSource;
use crate::{
    human_date, now_ms, CatalogError, CatalogRecord, RawRecord, Result, SnapshotMetadata,
    SyncCheckpoint,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: usize,
    /// Pause between page requests, to stay under the source's rate limits.
    pub page_delay: Duration,
    /// A checkpoint older than this with no run in flight is abandoned.
    pub stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            page_delay: Duration::from_millis(200),
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    Completed { count: usize },
    /// A page request failed. Progress up to `offset` is checkpointed and the
    /// previous snapshot is untouched.
    Aborted { count: usize, offset: u64, error: CatalogError },
    /// Another run was already in flight.
    Skipped,
}

impl SyncOutcome {
    pub fn count(&self) -> Option<usize> {
        match self {
            SyncOutcome::Completed { count } | SyncOutcome::Aborted { count, .. } => Some(*count),
            SyncOutcome::Skipped => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHealth {
    pub ready: bool,
    pub metadata: Option<SnapshotMetadata>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owned form of [`RunningGuard`] for runs moved onto a spawned task. Also
/// released when the task is dropped before it is first polled.
struct ClaimedRun<Src, St>(Arc<CatalogSynchronizer<Src, St>>);

impl<Src, St> Drop for ClaimedRun<Src, St> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

pub struct CatalogSynchronizer<Src, St> {
    source: Src,
    store: Arc<St>,
    index: Arc<SearchIndex<St>>,
    config: SyncConfig,
    running: AtomicBool,
}

impl<Src: PageSource, St: CheckpointStore> CatalogSynchronizer<Src, St> {
    pub fn new(source: Src, store: Arc<St>, config: SyncConfig) -> Self {
        let index = Arc::new(SearchIndex::new(store.clone()));
        Self { source, store, index, config, running: AtomicBool::new(false) }
    }

    /// The index whose working copy is swapped after each completed run.
    pub fn index(&self) -> &Arc<SearchIndex<St>> {
        &self.index
    }

    pub fn source(&self) -> &Src {
        &self.source
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a full sync, resuming an interrupted one unless `force_restart`.
    ///
    /// Source failures come back as [`SyncOutcome::Aborted`]; storage
    /// failures are returned as errors since the checkpoint can no longer be
    /// relied on.
    pub async fn synchronize(&self, force_restart: bool) -> Result<SyncOutcome> {
        if !self.try_claim() {
            return Ok(SyncOutcome::Skipped);
        }
        // Released on every exit, including the future being dropped.
        let _guard = RunningGuard(&self.running);
        self.run(force_restart).await
    }

    fn try_claim(&self) -> bool {
        let claimed = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            info!("sync already in flight, skipping");
        }
        claimed
    }

    async fn run(&self, force_restart: bool) -> Result<SyncOutcome> {
        let store = self.store.as_ref();
        let page_size = self.config.page_size.max(1);

        let (mut records, mut offset, mut pages) = match load_checkpoint(store)? {
            Some(cp) if !force_restart => {
                let records = load_journal(store, cp.pages)?;
                info!(offset = cp.offset, records = records.len(), "resuming interrupted sync");
                (records, cp.offset, cp.pages)
            }
            Some(cp) => {
                discard_run(store, cp.pages)?;
                (Vec::new(), 0, 0)
            }
            None => (Vec::new(), 0, 0),
        };
        let mut seen: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

        loop {
            let raw = match self.source.fetch_page(page_size, offset).await {
                Ok(raw) => raw,
                Err(e) => {
                    let checkpoint = SyncCheckpoint { offset, timestamp_ms: now_ms(), pages };
                    save_checkpoint(store, &checkpoint)?;
                    warn!(
                        offset,
                        records = records.len(),
                        error = %e,
                        "sync aborted, checkpoint kept"
                    );
                    return Ok(SyncOutcome::Aborted {
                        count: records.len(),
                        offset,
                        error: CatalogError::SourceFetch { offset, message: e.to_string() },
                    });
                }
            };
            if raw.is_empty() {
                break;
            }
            let fetched = raw.len();
            let page: Vec<CatalogRecord> = raw
                .into_iter()
                .filter_map(RawRecord::into_record)
                .filter(|r| seen.insert(r.id.clone()))
                .collect();

            offset += page_size as u64;
            let checkpoint = SyncCheckpoint { offset, timestamp_ms: now_ms(), pages: pages + 1 };
            journal_page(store, pages, &page, &checkpoint)?;
            pages += 1;
            records.extend(page);
            debug!(offset, fetched, total = records.len(), "page synced");

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        let ts = now_ms();
        let meta =
            SnapshotMetadata { count: records.len(), timestamp_ms: ts, human_date: human_date(ts) };
        commit_snapshot(store, &records, &meta, pages)?;
        let count = records.len();
        self.index.replace(records);
        info!(count, pages, date = %meta.human_date, "catalog sync complete");
        Ok(SyncOutcome::Completed { count })
    }

    /// Report whether a complete snapshot is available. An abandoned
    /// checkpoint is deleted here; nothing else is written and no sync is
    /// started.
    pub fn check_sync_health(&self) -> Result<SyncHealth> {
        sync_health(self.store.as_ref(), self.config.stale_after, self.is_running())
    }
}

impl<Src, St> CatalogSynchronizer<Src, St>
where
    Src: PageSource + 'static,
    St: CheckpointStore + 'static,
{
    /// Claim the run slot now and sync on a spawned task. Returns `None`
    /// without spawning when a run is already in flight, so the caller knows
    /// the outcome of the claim before answering anyone.
    pub fn spawn_sync(
        self: &Arc<Self>,
        force_restart: bool,
    ) -> Option<JoinHandle<Result<SyncOutcome>>> {
        if !self.try_claim() {
            return None;
        }
        let claim = ClaimedRun(self.clone());
        Some(tokio::spawn(async move {
            let result = claim.0.run(force_restart).await;
            match &result {
                Ok(outcome) => info!(?outcome, "background sync finished"),
                Err(e) => error!(error = %e, "background sync failed"),
            }
            result
        }))
    }
}

/// Health check against a bare store, for callers that do not hold a
/// synchronizer. `run_in_flight` suppresses the stale-checkpoint cleanup.
pub fn sync_health<St: CheckpointStore + ?Sized>(
    store: &St,
    stale_after: Duration,
    run_in_flight: bool,
) -> Result<SyncHealth> {
    let metadata = load_meta(store)?;
    let ready = match load_checkpoint(store)? {
        None => metadata.as_ref().is_some_and(|m| m.count > 0),
        Some(cp) => {
            let age_ms = now_ms().saturating_sub(cp.timestamp_ms);
            if !run_in_flight && age_ms >= stale_after.as_millis() as i64 {
                warn!(
                    offset = cp.offset,
                    age_s = age_ms / 1000,
                    "discarding abandoned sync checkpoint"
                );
                discard_run(store, cp.pages)?;
            }
            false
        }
    };
    Ok(SyncHealth { ready, metadata })
}
