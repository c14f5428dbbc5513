use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{
    CatalogEntry, CatalogEntryDraft, CatalogEntryRow, CatalogPartition, LocalFileHandle,
    StoreError,
};

/// Columns selected for every `CatalogEntryRow` query
const ENTRY_COLUMNS: &str = "id, name, description, language_code, category, flavor, group_id, \
     size_bytes, article_count, media_count, created_at, favicon_url, favicon_data, download_url, \
     local_file_handle, included_in_search, has_details, has_pictures, has_videos, \
     requires_service_workers";

/// 17 bound columns * 40 rows = 680 parameters, under SQLite's 999 limit
const INSERT_BATCH_SIZE: usize = 40;

impl Database {
    // ========================================================================
    // Bulk Operations (reconciliation)
    // ========================================================================

    /// Insert drafts as new catalog rows in a single transaction.
    ///
    /// The input is drained to completion; running out of drafts is the
    /// success condition. Any statement failure rolls back the whole batch.
    /// Rows whose id already exists (written by a concurrent writer since
    /// the caller computed its diff) are left untouched and not counted.
    ///
    /// # Returns
    ///
    /// The number of rows actually inserted.
    pub async fn bulk_insert<I>(&self, drafts: I) -> Result<u64, StoreError>
    where
        I: IntoIterator<Item = CatalogEntryDraft>,
    {
        let mut drafts = drafts.into_iter().peekable();
        if drafts.peek().is_none() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted: u64 = 0;
        let mut chunk: Vec<CatalogEntryDraft> = Vec::with_capacity(INSERT_BATCH_SIZE);

        loop {
            chunk.clear();
            chunk.extend(drafts.by_ref().take(INSERT_BATCH_SIZE));
            if chunk.is_empty() {
                break;
            }

            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO catalog_entries (id, name, description, language_code, category, \
                 flavor, group_id, size_bytes, article_count, media_count, created_at, \
                 favicon_url, download_url, has_details, has_pictures, has_videos, \
                 requires_service_workers) ",
            );
            builder.push_values(&chunk, |mut b, draft| {
                b.push_bind(&draft.id)
                    .push_bind(&draft.name)
                    .push_bind(&draft.description)
                    .push_bind(&draft.language_code)
                    .push_bind(&draft.category)
                    .push_bind(&draft.flavor)
                    .push_bind(&draft.group_id)
                    .push_bind(draft.size_bytes)
                    .push_bind(draft.article_count)
                    .push_bind(draft.media_count)
                    .push_bind(draft.created_at)
                    .push_bind(&draft.favicon_url)
                    .push_bind(&draft.download_url)
                    .push_bind(draft.has_details)
                    .push_bind(draft.has_pictures)
                    .push_bind(draft.has_videos)
                    .push_bind(draft.requires_service_workers);
            });
            builder.push(" ON CONFLICT(id) DO NOTHING");

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(inserted, "Catalog bulk insert committed");
        Ok(inserted)
    }

    /// Delete every remote-only entry whose id is not in `keep`.
    ///
    /// The predicate is `id NOT IN keep AND local_file_handle IS NULL`,
    /// evaluated at delete time, so an entry that gained a local handle after
    /// the caller's diff is never removed. The id set is bound as a single
    /// JSON array to stay clear of SQLite's parameter limit.
    pub async fn bulk_delete_remote_except(
        &self,
        keep: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        let keep_json = serde_json::to_string(keep)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM catalog_entries
            WHERE local_file_handle IS NULL
              AND id NOT IN (SELECT value FROM json_each(?))
        "#,
        )
        .bind(keep_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(deleted = result.rows_affected(), "Catalog bulk delete committed");
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Single-row Writes
    // ========================================================================

    /// Store icon bytes for an entry.
    ///
    /// Returns `false` when the entry no longer exists.
    pub async fn upsert_favicon(&self, entry_id: &str, bytes: &[u8]) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE catalog_entries SET favicon_data = ? WHERE id = ?")
            .bind(bytes)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Create or refresh an entry for a file the user opened on this device.
    ///
    /// Metadata is overwritten from the draft; favicon and download URLs are
    /// only replaced when the draft carries a value. The handle marks the
    /// entry as local, which shields it from reconciliation deletes.
    pub async fn add_local_entry(
        &self,
        draft: &CatalogEntryDraft,
        handle: &LocalFileHandle,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO catalog_entries (id, name, description, language_code, category,
                flavor, group_id, size_bytes, article_count, media_count, created_at,
                favicon_url, download_url, has_details, has_pictures, has_videos,
                requires_service_workers, local_file_handle)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                language_code = excluded.language_code,
                category = excluded.category,
                flavor = excluded.flavor,
                group_id = excluded.group_id,
                size_bytes = excluded.size_bytes,
                article_count = excluded.article_count,
                media_count = excluded.media_count,
                created_at = excluded.created_at,
                favicon_url = COALESCE(excluded.favicon_url, catalog_entries.favicon_url),
                download_url = COALESCE(excluded.download_url, catalog_entries.download_url),
                has_details = excluded.has_details,
                has_pictures = excluded.has_pictures,
                has_videos = excluded.has_videos,
                requires_service_workers = excluded.requires_service_workers,
                local_file_handle = excluded.local_file_handle
        "#,
        )
        .bind(&draft.id)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.language_code)
        .bind(&draft.category)
        .bind(&draft.flavor)
        .bind(&draft.group_id)
        .bind(draft.size_bytes)
        .bind(draft.article_count)
        .bind(draft.media_count)
        .bind(draft.created_at)
        .bind(&draft.favicon_url)
        .bind(&draft.download_url)
        .bind(draft.has_details)
        .bind(draft.has_pictures)
        .bind(draft.has_videos)
        .bind(draft.requires_service_workers)
        .bind(&handle.0)
        .execute(&self.pool)
        .await?;

        tracing::info!(entry_id = %draft.id, "Local entry recorded");
        Ok(())
    }

    /// Drop the local-file association of an entry.
    ///
    /// The row stays; it becomes an ordinary remote entry and is subject to
    /// the next reconciliation. Returns `false` if the entry had no handle.
    pub async fn unlink_local_entry(&self, entry_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE catalog_entries SET local_file_handle = NULL WHERE id = ? AND local_file_handle IS NOT NULL",
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current identifier set, split by local availability
    pub async fn catalog_partition(&self) -> Result<CatalogPartition, StoreError> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT id, local_file_handle IS NOT NULL FROM catalog_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut partition = CatalogPartition::default();
        for (id, is_local) in rows {
            if is_local {
                partition.local.insert(id);
            } else {
                partition.remote_only.insert(id);
            }
        }
        Ok(partition)
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        let row = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE id = ?"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CatalogEntryRow::into_entry))
    }

    /// Fetch several entries at once; ids with no row are simply absent
    pub async fn get_entries(&self, entry_ids: &[String]) -> Result<Vec<CatalogEntry>, StoreError> {
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids_json = serde_json::to_string(entry_ids)?;

        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE id IN (SELECT value FROM json_each(?))"
        ))
        .bind(ids_json)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CatalogEntryRow::into_entry).collect())
    }

    /// All entries ordered by name
    pub async fn list_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries ORDER BY name, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CatalogEntryRow::into_entry).collect())
    }

    /// Entries that have a favicon URL but no cached bytes, as `(id, url)`
    pub async fn entries_missing_favicon(
        &self,
        limit: i64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, favicon_url
            FROM catalog_entries
            WHERE favicon_data IS NULL AND favicon_url IS NOT NULL
            ORDER BY id
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn entry_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM catalog_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
