use super::schema::Database;
use super::types::{ChangeKind, ChangeRecord, ResumptionToken, StoreError};

impl Database {
    // ========================================================================
    // Change Log Reads
    // ========================================================================

    /// Position of the newest log record, `None` if the log is empty
    pub async fn change_log_head(&self) -> Result<Option<i64>, StoreError> {
        let (head,): (Option<i64>,) = sqlx::query_as("SELECT MAX(position) FROM change_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(head)
    }

    /// Records strictly after `token`, in log order.
    ///
    /// `None` reads from the beginning of the (possibly pruned) log.
    pub async fn changes_after(
        &self,
        token: Option<ResumptionToken>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let after = token.map(ResumptionToken::position).unwrap_or(0);
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT position, entry_id, kind, recorded_at
            FROM change_log
            WHERE position > ?
            ORDER BY position
            LIMIT ?
        "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(position, entry_id, kind, recorded_at)| {
                Ok(ChangeRecord {
                    position,
                    entry_id,
                    kind: ChangeKind::parse(&kind)?,
                    recorded_at,
                })
            })
            .collect()
    }

    // ========================================================================
    // Resumption Tokens
    // ========================================================================

    /// Load the persisted token of a consumer, `None` on first run
    pub async fn load_token(&self, consumer: &str) -> Result<Option<ResumptionToken>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT token FROM sync_cursors WHERE consumer = ?")
                .bind(consumer)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            None => Ok(None),
            Some((bytes,)) => ResumptionToken::from_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::CorruptToken(consumer.to_string())),
        }
    }

    /// Persist a consumer's token and mark the cursor as live.
    ///
    /// The stored token never moves backwards: a lower token only refreshes
    /// `updated_at`. Byte comparison is valid because tokens are big-endian.
    pub async fn store_token(
        &self,
        consumer: &str,
        token: ResumptionToken,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (consumer, token, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(consumer) DO UPDATE SET
                token = CASE WHEN excluded.token > sync_cursors.token
                             THEN excluded.token ELSE sync_cursors.token END,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(consumer)
        .bind(token.to_bytes().to_vec())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Delete log records recorded before `cutoff` (unix seconds).
    ///
    /// Records the oldest live cursor has not consumed yet are kept. A cursor
    /// counts as live when it was stored at or after `cutoff`; cursors idle
    /// for longer than the retention window no longer hold back pruning.
    ///
    /// # Returns
    ///
    /// The number of records removed.
    pub async fn prune_change_log(&self, cutoff: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let cursors: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT consumer, token FROM sync_cursors WHERE updated_at >= ?")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await?;

        let mut oldest_live: Option<i64> = None;
        for (consumer, bytes) in &cursors {
            match ResumptionToken::from_bytes(bytes) {
                Some(token) => {
                    oldest_live =
                        Some(oldest_live.map_or(token.position(), |p| p.min(token.position())));
                }
                None => {
                    tracing::warn!(consumer = %consumer, "Ignoring corrupt cursor while pruning");
                }
            }
        }

        let result = match oldest_live {
            Some(limit) => {
                sqlx::query("DELETE FROM change_log WHERE recorded_at < ? AND position <= ?")
                    .bind(cutoff)
                    .bind(limit)
                    .execute(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM change_log WHERE recorded_at < ?")
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
