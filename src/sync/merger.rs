//! Change log consumption.
//!
//! Each process owns one [`ChangeLogMerger`] under its consumer name. A merge
//! reads the log after the persisted resumption token, applies every record
//! to the process's [`QueryCache`], publishes a [`CatalogEvent`] per record,
//! and persists the new token. Records are applied at least once: a crash
//! between applying and persisting replays them, which is harmless because
//! applying a record always reloads the current row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::{CatalogEvent, ChangeSignal, QueryCache};
use crate::storage::{ChangeKind, Database, ResumptionToken, StoreError};
use crate::util::catch_task_panic;

/// Log records read per page
const MERGE_PAGE_SIZE: i64 = 500;
/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result of one merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records applied in this pass
    pub applied: usize,
    /// Token persisted at the end of the pass
    pub token: Option<ResumptionToken>,
}

pub struct ChangeLogMerger {
    db: Database,
    consumer: String,
    cache: Arc<QueryCache>,
    signal: ChangeSignal,
    events: broadcast::Sender<CatalogEvent>,
    /// Serializes the token read-apply-persist sequence within the process
    lock: Mutex<()>,
}

impl ChangeLogMerger {
    pub fn new(db: Database, consumer: impl Into<String>, cache: Arc<QueryCache>, signal: ChangeSignal) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            consumer: consumer.into(),
            cache,
            signal,
            events,
            lock: Mutex::new(()),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Receive one event per applied change log record
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    /// Ask the worker for a merge pass.
    ///
    /// Requests made while a pass is running coalesce into one more pass.
    pub fn request_merge(&self) {
        self.signal.notify();
    }

    /// Apply every record after the persisted token.
    ///
    /// Concurrent calls in the same process run one after another; a caller
    /// that waited finds nothing left to apply.
    pub async fn merge(&self) -> Result<MergeReport, StoreError> {
        let _guard = self.lock.lock().await;

        let mut token = self.db.load_token(&self.consumer).await?;
        let mut report = MergeReport {
            applied: 0,
            token,
        };

        loop {
            let page = self.db.changes_after(token, MERGE_PAGE_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };

            let mut reload: Vec<String> = page
                .iter()
                .filter(|record| record.kind != ChangeKind::Delete)
                .map(|record| record.entry_id.clone())
                .collect();
            reload.sort_unstable();
            reload.dedup();
            let current: HashMap<String, _> = self
                .db
                .get_entries(&reload)
                .await?
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect();

            for record in &page {
                match record.kind {
                    ChangeKind::Insert | ChangeKind::Update => {
                        // Several records of a page may name the same row; each
                        // caches the state read for the page. `None` means the
                        // row is gone by read time.
                        match current.get(&record.entry_id) {
                            Some(entry) => {
                                self.cache.put(entry.clone());
                            }
                            None => {
                                self.cache.evict(&record.entry_id);
                            }
                        }
                    }
                    ChangeKind::Delete => {
                        self.cache.evict(&record.entry_id);
                    }
                }
                // No subscribers is fine
                let _ = self.events.send(CatalogEvent {
                    entry_id: record.entry_id.clone(),
                    kind: record.kind,
                    position: record.position,
                });
            }

            report.applied += page.len();
            let next = ResumptionToken::after(last);
            self.db.store_token(&self.consumer, next).await?;
            token = Some(next);

            if (page.len() as i64) < MERGE_PAGE_SIZE {
                break;
            }
        }

        if report.applied == 0 {
            if let Some(unchanged) = token {
                // Keep the cursor counted as live for pruning
                self.db.store_token(&self.consumer, unchanged).await?;
            }
        } else {
            tracing::debug!(
                consumer = %self.consumer,
                applied = report.applied,
                "Merged change log"
            );
        }
        report.token = token;
        Ok(report)
    }

    /// Run merges whenever the change signal fires, starting with one pass
    /// right away. The task runs until aborted.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let merger = Arc::clone(self);
        let mut wake = self.signal.subscribe();
        wake.mark_changed();

        tokio::spawn(async move {
            while wake.changed().await.is_ok() {
                wake.borrow_and_update();
                match catch_task_panic(merger.merge()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(consumer = %merger.consumer, error = %e, "Change log merge failed");
                    }
                    Err(panic_msg) => {
                        tracing::error!(consumer = %merger.consumer, error = %panic_msg, "Change log merge panicked");
                    }
                }
            }
        })
    }

    /// Periodically delete log records older than `retention`.
    ///
    /// Records the oldest live cursor still needs are kept; see
    /// [`Database::prune_change_log`].
    pub fn spawn_pruner(db: Database, retention: Duration, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match prune_once(&db, retention).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "Pruned change log"),
                    Err(e) => tracing::warn!(error = %e, "Change log pruning failed"),
                }
            }
        })
    }
}

/// Prune records older than `retention` as of now
pub async fn prune_once(db: &Database, retention: Duration) -> Result<u64, StoreError> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = chrono::Utc::now()
        .checked_sub_signed(retention)
        .map_or(0, |at| at.timestamp());
    db.prune_change_log(cutoff).await
}
