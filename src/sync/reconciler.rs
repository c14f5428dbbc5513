//! Reconciliation of the local catalog against the remote feed.
//!
//! A refresh fetches and parses the whole feed before touching the store,
//! then applies the difference as two bulk transactions: new remote entries
//! are inserted, remote entries that vanished from the feed are deleted.
//! Entries backed by a local file are never deleted.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

use super::{ChangeSignal, StorePhase, SyncError};
use crate::feed::{fetch_feed, parse_catalog};
use crate::storage::{CatalogEntryDraft, CatalogPartition, Database};

/// What asked for the refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Always proceeds (unless a refresh is already running)
    UserInitiated,
    /// Proceeds only when auto refresh is on and the catalog is stale
    Automatic,
}

/// When automatic triggers are allowed to refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub auto_refresh: bool,
    pub stale_after: chrono::Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            stale_after: chrono::Duration::minutes(60),
        }
    }
}

impl RefreshPolicy {
    /// Whether an automatic trigger should refresh given the last success
    pub fn is_due(&self, last_refresh: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if !self.auto_refresh {
            return false;
        }
        match last_refresh {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.stale_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh has ever succeeded
    Initial,
    InProgress,
    Complete,
}

/// Observable refresh progress, for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStatus {
    pub state: RefreshState,
    /// The most recent attempt failed
    pub last_failed: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Counts from a completed refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub inserted: u64,
    pub deleted: u64,
    /// Malformed feed entries that were skipped
    pub skipped: usize,
    /// Distinct entries in the feed
    pub remote_total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another refresh was running; nothing was done
    AlreadyInProgress,
    /// Automatic trigger while auto refresh is off or the catalog is fresh
    NotDue,
}

/// Difference between the feed and the store
#[derive(Debug, Default)]
pub struct RefreshPlan {
    pub to_insert: Vec<CatalogEntryDraft>,
    pub to_delete: HashSet<String>,
    /// Every distinct id in the feed
    pub remote_ids: HashSet<String>,
    /// Repeated ids in the feed; the first occurrence was kept
    pub duplicates: usize,
}

/// Compute what a refresh has to write.
///
/// `to_insert` is every feed entry the store does not know; `to_delete` is
/// every remote-only entry missing from the feed. Local entries appear in
/// neither set.
pub fn plan(drafts: Vec<CatalogEntryDraft>, partition: &CatalogPartition) -> RefreshPlan {
    let mut plan = RefreshPlan::default();

    for draft in drafts {
        if !plan.remote_ids.insert(draft.id.clone()) {
            plan.duplicates += 1;
            continue;
        }
        if !partition.contains(&draft.id) {
            plan.to_insert.push(draft);
        }
    }

    plan.to_delete = partition
        .remote_only
        .iter()
        .filter(|id| !plan.remote_ids.contains(*id))
        .cloned()
        .collect();

    plan
}

/// Languages offered per category, from a comma-separated language field
fn category_languages(drafts: &[CatalogEntryDraft]) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for draft in drafts {
        let languages = map.entry(draft.category.clone()).or_default();
        for code in draft.language_code.split(',') {
            let code = code.trim();
            if !code.is_empty() {
                languages.insert(code.to_string());
            }
        }
    }
    map
}

/// Runs catalog refreshes against one store.
///
/// At most one refresh runs at a time per `Reconciler`; concurrent callers
/// get [`RefreshOutcome::AlreadyInProgress`].
pub struct Reconciler {
    db: Database,
    client: reqwest::Client,
    feed_url: Url,
    request_timeout: Duration,
    policy: RefreshPolicy,
    signal: ChangeSignal,
    in_flight: tokio::sync::Mutex<()>,
    status: Mutex<RefreshStatus>,
}

impl Reconciler {
    /// Create a reconciler, seeding its status from the persisted last
    /// refresh time.
    pub async fn new(
        db: Database,
        client: reqwest::Client,
        feed_url: Url,
        request_timeout: Duration,
        policy: RefreshPolicy,
        signal: ChangeSignal,
    ) -> Result<Self, crate::storage::StoreError> {
        let last_refresh = db.last_refresh().await?;
        let state = if last_refresh.is_some() {
            RefreshState::Complete
        } else {
            RefreshState::Initial
        };

        Ok(Self {
            db,
            client,
            feed_url,
            request_timeout,
            policy,
            signal,
            in_flight: tokio::sync::Mutex::new(()),
            status: Mutex::new(RefreshStatus {
                state,
                last_failed: false,
                last_refresh,
            }),
        })
    }

    fn status_guard(&self) -> MutexGuard<'_, RefreshStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RefreshStatus {
        self.status_guard().clone()
    }

    /// Refresh the catalog from the remote feed.
    ///
    /// # Errors
    ///
    /// - [`SyncError::FeedUnreachable`] / [`SyncError::FeedUnreadable`]: the
    ///   store was not touched
    /// - [`SyncError::StoreWriteFailure`]: the failing phase was rolled
    ///   back; an insert phase committed before a failed delete stays
    pub async fn refresh(&self, trigger: RefreshTrigger) -> Result<RefreshOutcome, SyncError> {
        let Ok(_flight) = self.in_flight.try_lock() else {
            tracing::debug!(?trigger, "Refresh already in progress");
            return Ok(RefreshOutcome::AlreadyInProgress);
        };

        if trigger == RefreshTrigger::Automatic {
            let last_refresh = self
                .db
                .last_refresh()
                .await
                .map_err(SyncError::store(StorePhase::Read))?;
            if !self.policy.is_due(last_refresh, Utc::now()) {
                tracing::debug!(
                    auto_refresh = self.policy.auto_refresh,
                    ?last_refresh,
                    "Automatic refresh not due"
                );
                return Ok(RefreshOutcome::NotDue);
            }
        }

        let previous = {
            let mut status = self.status_guard();
            std::mem::replace(&mut status.state, RefreshState::InProgress)
        };
        tracing::info!(?trigger, url = %self.feed_url, "Refreshing catalog");

        match self.run().await {
            Ok((report, finished_at)) => {
                {
                    let mut status = self.status_guard();
                    status.state = RefreshState::Complete;
                    status.last_failed = false;
                    status.last_refresh = Some(finished_at);
                }

                tracing::info!(
                    inserted = report.inserted,
                    deleted = report.deleted,
                    skipped = report.skipped,
                    remote_total = report.remote_total,
                    "Catalog refresh complete"
                );
                Ok(RefreshOutcome::Completed(report))
            }
            Err(e) => {
                {
                    let mut status = self.status_guard();
                    status.state = previous;
                    status.last_failed = true;
                }

                tracing::warn!(error = %e, "Catalog refresh failed");
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<(RefreshReport, DateTime<Utc>), SyncError> {
        let bytes = fetch_feed(&self.client, self.feed_url.as_str(), self.request_timeout)
            .await
            .map_err(SyncError::FeedUnreachable)?;
        let parsed = parse_catalog(&bytes, &self.feed_url).map_err(SyncError::FeedUnreadable)?;
        drop(bytes);

        if parsed.skipped > 0 {
            tracing::warn!(skipped = parsed.skipped, "Malformed catalog entries skipped");
        }
        let languages = category_languages(&parsed.drafts);

        let partition = self
            .db
            .catalog_partition()
            .await
            .map_err(SyncError::store(StorePhase::Read))?;
        let plan = plan(parsed.drafts, &partition);
        if plan.duplicates > 0 {
            tracing::debug!(duplicates = plan.duplicates, "Duplicate feed entries ignored");
        }
        tracing::debug!(
            local = partition.local.len(),
            remote_only = partition.remote_only.len(),
            to_insert = plan.to_insert.len(),
            to_delete = plan.to_delete.len(),
            "Reconciliation plan"
        );

        let mut report = RefreshReport {
            skipped: parsed.skipped,
            remote_total: plan.remote_ids.len(),
            ..RefreshReport::default()
        };

        if !plan.to_insert.is_empty() {
            report.inserted = self
                .db
                .bulk_insert(plan.to_insert)
                .await
                .map_err(SyncError::store(StorePhase::Insert))?;
            self.signal.notify();
        }

        if !plan.to_delete.is_empty() {
            report.deleted = self
                .db
                .bulk_delete_remote_except(&plan.remote_ids)
                .await
                .map_err(SyncError::store(StorePhase::Delete))?;
            self.signal.notify();
        }

        let finished_at = Utc::now();
        self.db
            .set_last_refresh(finished_at)
            .await
            .map_err(SyncError::store(StorePhase::Bookkeeping))?;
        self.db
            .save_category_languages(&languages)
            .await
            .map_err(SyncError::store(StorePhase::Bookkeeping))?;

        Ok((report, finished_at))
    }
}
