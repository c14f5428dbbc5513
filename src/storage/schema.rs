use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};

// ============================================================================
// Database
// ============================================================================

/// Handle to the shared catalog store.
///
/// Constructed once per process and passed to every component that reads or
/// writes the catalog. Cloning is cheap (the pool is reference counted).
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// Several cooperating processes may open the same file. Writers are
    /// serialized by SQLite; `busy_timeout` makes a writer wait for the
    /// other process's transaction instead of failing immediately.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if the file stays locked past
    /// the busy timeout (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` or `DatabaseError::Other` otherwise.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the catalog file to the current user before the pool creates it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().is_some_and(|p| p.exists()) {
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for another writer (possibly
        // another process) before returning SQLITE_BUSY.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);
        if path != ":memory:" {
            // Readers in one process never block a writer in another
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        // Every connection to ":memory:" is a separate database
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(path = %path, "Catalog database ready");
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so opening an existing database
    /// (including one created by another process) is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Catalog of content packages, remote and local
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_entries (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                language_code TEXT NOT NULL,
                category TEXT NOT NULL,
                flavor TEXT NOT NULL,
                group_id TEXT,
                size_bytes INTEGER NOT NULL,
                article_count INTEGER NOT NULL,
                media_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                favicon_url TEXT,
                favicon_data BLOB,
                download_url TEXT,
                local_file_handle BLOB,
                included_in_search INTEGER NOT NULL DEFAULT 1,
                has_details INTEGER NOT NULL DEFAULT 0,
                has_pictures INTEGER NOT NULL DEFAULT 0,
                has_videos INTEGER NOT NULL DEFAULT 0,
                requires_service_workers INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Partial index backing the reconciliation delete predicate
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_catalog_remote_only ON catalog_entries(id) WHERE local_file_handle IS NULL",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_group ON catalog_entries(group_id)")
            .execute(&mut *tx)
            .await?;
        // Favicon enrichment scans for rows with a URL but no bytes yet
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_catalog_favicon_missing ON catalog_entries(id) WHERE favicon_data IS NULL AND favicon_url IS NOT NULL",
        )
        .execute(&mut *tx)
        .await?;

        // Bookmarks are owned by the bookmarking UI; no FK to the catalog
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookmarks (
                url TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                snippet TEXT,
                thumbnail_url TEXT,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Append-only change log. AUTOINCREMENT keeps positions from being
        // reused after the tail is pruned.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('insert', 'update', 'delete')),
                recorded_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_log_recorded ON change_log(recorded_at)",
        )
        .execute(&mut *tx)
        .await?;

        // Log triggers run inside the writing transaction, so every writer
        // in every process records its changes the same way.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS catalog_log_insert AFTER INSERT ON catalog_entries BEGIN
                INSERT INTO change_log (entry_id, kind, recorded_at)
                VALUES (new.id, 'insert', CAST(strftime('%s', 'now') AS INTEGER));
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS catalog_log_update AFTER UPDATE ON catalog_entries BEGIN
                INSERT INTO change_log (entry_id, kind, recorded_at)
                VALUES (new.id, 'update', CAST(strftime('%s', 'now') AS INTEGER));
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS catalog_log_delete AFTER DELETE ON catalog_entries BEGIN
                INSERT INTO change_log (entry_id, kind, recorded_at)
                VALUES (old.id, 'delete', CAST(strftime('%s', 'now') AS INTEGER));
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // One resumption token per consumer process
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                consumer TEXT PRIMARY KEY NOT NULL,
                token BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Key-value store for refresh bookkeeping.
        // Keys use dotted convention: library.last_refresh, library.category_languages
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let path = path.to_str().unwrap();

        let first = Database::open(path).await.unwrap();
        drop(first);
        let second = Database::open(path).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&second.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "bookmarks",
                "catalog_entries",
                "change_log",
                "sync_cursors",
                "user_preferences"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_database_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        Database::open(path.to_str().unwrap()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
