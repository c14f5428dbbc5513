//! Catalog synchronization.
//!
//! - [`reconciler`] - brings the store in line with the remote feed
//! - [`merger`] - drains the change log into this process's [`QueryCache`]
//! - [`signal`] - wake-ups for the merger, local and cross-process
//! - [`cache`] - the bounded entry cache merges are applied to

pub mod cache;
pub mod merger;
pub mod reconciler;
pub mod signal;

pub use cache::QueryCache;
pub use merger::{ChangeLogMerger, MergeReport};
pub use reconciler::{
    RefreshOutcome, RefreshPolicy, RefreshReport, RefreshState, RefreshStatus, RefreshTrigger,
    Reconciler,
};
pub use signal::{ChangeSignal, LogWatcher};

use std::fmt;
use thiserror::Error;

use crate::feed::{FetchError, ParseError};
use crate::storage::{ChangeKind, StoreError};

/// Emitted by the merger for every change log record it applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEvent {
    pub entry_id: String,
    pub kind: ChangeKind,
    pub position: i64,
}

/// Which reconciliation step a store write failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    /// Reading the current catalog partition
    Read,
    Insert,
    Delete,
    /// Recording refresh bookkeeping after both writes committed
    Bookkeeping,
}

impl fmt::Display for StorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorePhase::Read => "read",
            StorePhase::Insert => "insert",
            StorePhase::Delete => "delete",
            StorePhase::Bookkeeping => "bookkeeping",
        };
        f.write_str(name)
    }
}

/// Failures surfaced by a catalog refresh.
///
/// A refresh aborts before touching the store on the first two variants. A
/// [`SyncError::StoreWriteFailure`] in the delete phase leaves the committed
/// insert phase in place.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Catalog feed unreachable: {0}")]
    FeedUnreachable(#[source] FetchError),

    #[error("Catalog feed unreadable: {0}")]
    FeedUnreadable(#[source] ParseError),

    #[error("Catalog store write failed during {phase}: {source}")]
    StoreWriteFailure {
        phase: StorePhase,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub(crate) fn store(phase: StorePhase) -> impl FnOnce(StoreError) -> Self {
        move |source| SyncError::StoreWriteFailure { phase, source }
    }
}
