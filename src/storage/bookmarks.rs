use super::schema::Database;
use super::types::{Bookmark, StoreError};

impl Database {
    // ========================================================================
    // Bookmark Operations
    // ========================================================================

    /// Save a bookmark, replacing title/snippet/thumbnail if the URL exists
    pub async fn add_bookmark(&self, bookmark: &Bookmark) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bookmarks (url, title, snippet, thumbnail_url, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                snippet = excluded.snippet,
                thumbnail_url = excluded.thumbnail_url
        "#,
        )
        .bind(&bookmark.url)
        .bind(&bookmark.title)
        .bind(&bookmark.snippet)
        .bind(&bookmark.thumbnail_url)
        .bind(bookmark.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bookmarks whose content URL points into the given entry, newest first.
    ///
    /// Matching uses the URL host, which is case-insensitive.
    pub async fn bookmarks_for_entry(&self, entry_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let all = sqlx::query_as::<_, Bookmark>(
            r#"
            SELECT url, title, snippet, thumbnail_url, created_at
            FROM bookmarks
            WHERE url LIKE ?
            ORDER BY created_at DESC
        "#,
        )
        .bind(format!("%://{}/%", entry_id))
        .fetch_all(&self.pool)
        .await?;

        let wanted = entry_id.to_lowercase();
        Ok(all
            .into_iter()
            .filter(|b| b.entry_id().as_deref() == Some(wanted.as_str()))
            .collect())
    }

    /// Returns `false` if there was no bookmark with that URL
    pub async fn remove_bookmark(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogEntryDraft;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn bookmark(url: &str, created_at: i64) -> Bookmark {
        Bookmark {
            url: url.to_string(),
            title: "Saved page".to_string(),
            snippet: Some("First paragraph".to_string()),
            thumbnail_url: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_bookmarks_for_entry_filters_by_host() {
        let db = test_db().await;
        db.add_bookmark(&bookmark("kiwix://abc/A/One", 1)).await.unwrap();
        db.add_bookmark(&bookmark("kiwix://abc/A/Two", 2)).await.unwrap();
        db.add_bookmark(&bookmark("kiwix://xyz/A/Other", 3))
            .await
            .unwrap();

        let found = db.bookmarks_for_entry("abc").await.unwrap();
        let urls: Vec<&str> = found.iter().map(|b| b.url.as_str()).collect();
        assert_eq!(urls, vec!["kiwix://abc/A/Two", "kiwix://abc/A/One"]);
    }

    #[tokio::test]
    async fn test_remove_bookmark() {
        let db = test_db().await;
        db.add_bookmark(&bookmark("kiwix://abc/A/One", 1)).await.unwrap();

        assert!(db.remove_bookmark("kiwix://abc/A/One").await.unwrap());
        assert!(!db.remove_bookmark("kiwix://abc/A/One").await.unwrap());
    }

    #[tokio::test]
    async fn test_catalog_delete_leaves_bookmarks() {
        let db = test_db().await;
        db.bulk_insert(vec![CatalogEntryDraft {
            id: "abc".to_string(),
            name: "Gone soon".to_string(),
            description: String::new(),
            language_code: "eng".to_string(),
            category: "other".to_string(),
            flavor: String::new(),
            group_id: None,
            size_bytes: 0,
            article_count: 0,
            media_count: 0,
            created_at: 0,
            favicon_url: None,
            download_url: None,
            has_details: false,
            has_pictures: false,
            has_videos: false,
            requires_service_workers: false,
        }])
        .await
        .unwrap();
        db.add_bookmark(&bookmark("kiwix://abc/A/One", 1)).await.unwrap();

        db.bulk_delete_remote_except(&Default::default())
            .await
            .unwrap();

        assert_eq!(db.entry_count().await.unwrap(), 0);
        assert_eq!(db.bookmarks_for_entry("abc").await.unwrap().len(), 1);
    }
}
