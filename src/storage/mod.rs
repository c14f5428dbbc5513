//! Transactional catalog store backed by SQLite.
//!
//! One `Database` handle is opened per process and shared by every
//! component. The same file may be opened by several cooperating processes;
//! every catalog write appends to the change log through triggers, inside
//! the writing transaction.

mod bookmarks;
mod catalog;
mod change_log;
mod preferences;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Bookmark, CatalogEntry, CatalogEntryDraft, CatalogPartition, ChangeKind, ChangeRecord,
    DatabaseError, LocalFileHandle, ResumptionToken, StoreError,
};
