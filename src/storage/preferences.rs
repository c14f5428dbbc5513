use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::schema::Database;
use super::types::StoreError;

/// Timestamp of the last successful catalog refresh (RFC 3339)
const KEY_LAST_REFRESH: &str = "library.last_refresh";
/// JSON map of category -> languages offered in that category
const KEY_CATEGORY_LANGUAGES: &str = "library.category_languages";

impl Database {
    // ========================================================================
    // User Preferences Operations
    // ========================================================================

    /// Get a single preference value by key.
    ///
    /// Keys use dotted convention: `library.last_refresh`, `library.category_languages`.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a preference value (UPSERT).
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Refresh Bookkeeping
    // ========================================================================

    /// When the catalog was last refreshed successfully, if ever
    pub async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.get_preference(KEY_LAST_REFRESH).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Ignoring unparsable last refresh timestamp");
                Ok(None)
            }
        }
    }

    pub async fn set_last_refresh(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_preference(KEY_LAST_REFRESH, &at.to_rfc3339()).await
    }

    /// Persist which languages each category is available in.
    ///
    /// Language filter UIs read this to offer only languages that have content.
    pub async fn save_category_languages(
        &self,
        map: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(map)?;
        self.set_preference(KEY_CATEGORY_LANGUAGES, &json).await
    }

    pub async fn category_languages(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        match self.get_preference(KEY_CATEGORY_LANGUAGES).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_preference_missing() {
        let db = test_db().await;
        let value = db.get_preference("nonexistent.key").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_preference_upsert() {
        let db = test_db().await;
        db.set_preference("library.auto", "on").await.unwrap();
        db.set_preference("library.auto", "off").await.unwrap();

        let value = db.get_preference("library.auto").await.unwrap();
        assert_eq!(value, Some("off".to_string()));
    }

    #[tokio::test]
    async fn test_last_refresh_roundtrip() {
        let db = test_db().await;
        assert_eq!(db.last_refresh().await.unwrap(), None);

        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        db.set_last_refresh(at).await.unwrap();
        assert_eq!(db.last_refresh().await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_garbled_last_refresh_reads_as_never() {
        let db = test_db().await;
        db.set_preference(KEY_LAST_REFRESH, "yesterday").await.unwrap();
        assert_eq!(db.last_refresh().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_category_languages_roundtrip() {
        let db = test_db().await;
        assert!(db.category_languages().await.unwrap().is_empty());

        let mut map = BTreeMap::new();
        map.insert(
            "wikipedia".to_string(),
            ["eng", "fra"].iter().map(|s| s.to_string()).collect(),
        );
        db.save_category_languages(&map).await.unwrap();
        assert_eq!(db.category_languages().await.unwrap(), map);
    }
}
