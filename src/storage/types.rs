use std::collections::HashSet;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening or migrating the catalog database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The catalog database is locked by another process. Please try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface
/// as one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Errors raised by catalog store reads and writes
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// An identifier set could not be encoded for a bulk statement
    #[error("Failed to encode identifier set: {0}")]
    Encode(#[from] serde_json::Error),

    /// A cursor row holds bytes that are not a resumption token
    #[error("Corrupt resumption token stored for consumer '{0}'")]
    CorruptToken(String),

    /// The change log contains a kind this build does not know
    #[error("Unknown change kind '{0}' in change log")]
    UnknownChangeKind(String),
}

// ============================================================================
// Catalog Types
// ============================================================================

/// Opaque reference to a user-granted file on disk.
///
/// The bytes are produced and interpreted by the platform file-access layer;
/// the store only persists them. A non-null handle marks an entry as locally
/// available, which exempts it from reconciliation deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHandle(pub Vec<u8>);

/// A catalog entry that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntryDraft {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language_code: String,
    pub category: String,
    pub flavor: String,
    /// Groups flavors of the same logical title
    pub group_id: Option<String>,
    pub size_bytes: i64,
    pub article_count: i64,
    pub media_count: i64,
    /// Unix seconds
    pub created_at: i64,
    pub favicon_url: Option<String>,
    pub download_url: Option<String>,
    pub has_details: bool,
    pub has_pictures: bool,
    pub has_videos: bool,
    pub requires_service_workers: bool,
}

/// A persisted catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language_code: String,
    pub category: String,
    pub flavor: String,
    pub group_id: Option<String>,
    pub size_bytes: i64,
    pub article_count: i64,
    pub media_count: i64,
    pub created_at: i64,
    pub favicon_url: Option<String>,
    pub favicon_data: Option<Vec<u8>>,
    pub download_url: Option<String>,
    pub local_file_handle: Option<LocalFileHandle>,
    pub included_in_search: bool,
    pub has_details: bool,
    pub has_pictures: bool,
    pub has_videos: bool,
    pub requires_service_workers: bool,
}

impl CatalogEntry {
    /// True when the entry points at a file on this device
    pub fn is_local(&self) -> bool {
        self.local_file_handle.is_some()
    }

    /// Metadata of this entry, for re-recording it (e.g. as a local entry)
    pub fn to_draft(&self) -> CatalogEntryDraft {
        CatalogEntryDraft {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            language_code: self.language_code.clone(),
            category: self.category.clone(),
            flavor: self.flavor.clone(),
            group_id: self.group_id.clone(),
            size_bytes: self.size_bytes,
            article_count: self.article_count,
            media_count: self.media_count,
            created_at: self.created_at,
            favicon_url: self.favicon_url.clone(),
            download_url: self.download_url.clone(),
            has_details: self.has_details,
            has_pictures: self.has_pictures,
            has_videos: self.has_videos,
            requires_service_workers: self.requires_service_workers,
        }
    }
}

/// Internal row type for catalog queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CatalogEntryRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language_code: String,
    pub category: String,
    pub flavor: String,
    pub group_id: Option<String>,
    pub size_bytes: i64,
    pub article_count: i64,
    pub media_count: i64,
    pub created_at: i64,
    pub favicon_url: Option<String>,
    pub favicon_data: Option<Vec<u8>>,
    pub download_url: Option<String>,
    pub local_file_handle: Option<Vec<u8>>,
    pub included_in_search: bool,
    pub has_details: bool,
    pub has_pictures: bool,
    pub has_videos: bool,
    pub requires_service_workers: bool,
}

impl CatalogEntryRow {
    pub(crate) fn into_entry(self) -> CatalogEntry {
        CatalogEntry {
            id: self.id,
            name: self.name,
            description: self.description,
            language_code: self.language_code,
            category: self.category,
            flavor: self.flavor,
            group_id: self.group_id,
            size_bytes: self.size_bytes,
            article_count: self.article_count,
            media_count: self.media_count,
            created_at: self.created_at,
            favicon_url: self.favicon_url,
            favicon_data: self.favicon_data,
            download_url: self.download_url,
            local_file_handle: self.local_file_handle.map(LocalFileHandle),
            included_in_search: self.included_in_search,
            has_details: self.has_details,
            has_pictures: self.has_pictures,
            has_videos: self.has_videos,
            requires_service_workers: self.requires_service_workers,
        }
    }
}

/// Identifier set of the catalog split by local availability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogPartition {
    /// Entries with a local-file handle; never touched by reconciliation
    pub local: HashSet<String>,
    /// Entries only known from the network
    pub remote_only: HashSet<String>,
}

impl CatalogPartition {
    pub fn contains(&self, id: &str) -> bool {
        self.local.contains(id) || self.remote_only.contains(id)
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote_only.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Bookmarks
// ============================================================================

/// A saved location inside a content package.
///
/// The content URL has the form `<scheme>://<entry-id>/<path>`, which ties
/// the bookmark to a catalog entry without a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Bookmark {
    pub url: String,
    pub title: String,
    pub snippet: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: i64,
}

impl Bookmark {
    /// Identifier of the catalog entry this bookmark points into
    pub fn entry_id(&self) -> Option<String> {
        let parsed = url::Url::parse(&self.url).ok()?;
        parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .map(str::to_lowercase)
    }
}

// ============================================================================
// Change Log
// ============================================================================

/// Kind of mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(StoreError::UnknownChangeKind(other.to_string())),
        }
    }
}

/// One row of the change log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Monotonic position; never reused, even after pruning
    pub position: i64,
    pub entry_id: String,
    pub kind: ChangeKind,
    /// Unix seconds
    pub recorded_at: i64,
}

/// Opaque cursor into the change log.
///
/// Encodes the position of the last applied record. The byte form is
/// big-endian so that byte order and log order agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResumptionToken(i64);

impl ResumptionToken {
    pub fn after(record: &ChangeRecord) -> Self {
        Self(record.position)
    }

    pub fn position(self) -> i64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = bytes.try_into().ok()?;
        let position = i64::from_be_bytes(raw);
        (position >= 0).then_some(Self(position))
    }
}
