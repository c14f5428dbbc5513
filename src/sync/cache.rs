use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::storage::{CatalogEntry, Database, StoreError};

/// Process-local cache of catalog entries, keyed by entry id.
///
/// Readers go through [`QueryCache::get_or_load`]; the change log merger keeps
/// cached rows current with writes from every process.
pub struct QueryCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<String, Arc<CatalogEntry>>,
    /// Bumped by every `put` and `evict`
    generation: u64,
}

/// Cache generation observed when a read-through load started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadTicket(u64);

impl QueryCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The cache holds plain data; a panic mid-operation cannot leave it inconsistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<CatalogEntry>> {
        self.lock().entries.get(entry_id).cloned()
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.lock().entries.contains(entry_id)
    }

    pub fn put(&self, entry: CatalogEntry) -> Arc<CatalogEntry> {
        let entry = Arc::new(entry);
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.put(entry.id.clone(), Arc::clone(&entry));
        entry
    }

    /// Returns `true` if the entry was cached
    pub fn evict(&self, entry_id: &str) -> bool {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.pop(entry_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Read through the cache, loading from the store on a miss.
    ///
    /// A row loaded while the merger applied changes may already be stale, so
    /// it is returned but not cached.
    pub async fn get_or_load(
        &self,
        db: &Database,
        entry_id: &str,
    ) -> Result<Option<Arc<CatalogEntry>>, StoreError> {
        if let Some(hit) = self.get(entry_id) {
            return Ok(Some(hit));
        }
        let ticket = self.begin_load();
        Ok(db
            .get_entry(entry_id)
            .await?
            .map(|entry| self.finish_load(ticket, entry)))
    }

    pub(crate) fn begin_load(&self) -> LoadTicket {
        LoadTicket(self.lock().generation)
    }

    /// Cache `entry` unless the cache changed since `ticket` was taken.
    ///
    /// When it changed, the cached row (if any) wins over the loaded one.
    pub(crate) fn finish_load(&self, ticket: LoadTicket, entry: CatalogEntry) -> Arc<CatalogEntry> {
        let mut inner = self.lock();
        if inner.generation != ticket.0 {
            tracing::trace!(entry_id = %entry.id, "Skipping cache fill raced by a merge");
            return match inner.entries.get(&entry.id) {
                Some(cached) => Arc::clone(cached),
                None => Arc::new(entry),
            };
        }
        let entry = Arc::new(entry);
        inner.entries.put(entry.id.clone(), Arc::clone(&entry));
        entry
    }
}
