//! Best-effort icon downloads for catalog entries.
//!
//! Icons are cosmetic: every failure is logged and swallowed, and nothing is
//! retried until the next time missing icons are requested.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::fetcher::{read_limited_bytes, FetchError};
use crate::storage::{Database, StoreError};
use crate::sync::ChangeSignal;
use crate::util::catch_task_panic;

/// Icons larger than this are rejected
const MAX_FAVICON_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum FaviconError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Not an image (content type '{0}')")]
    NotAnImage(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The entry was deleted while its icon was downloading
    #[error("Entry no longer exists")]
    EntryGone,

    #[error("Favicon fetcher is shut down")]
    Closed,
}

/// Downloads icons with bounded concurrency.
///
/// Cloning is cheap; clones share the concurrency limit.
#[derive(Clone)]
pub struct FaviconFetcher {
    db: Database,
    client: reqwest::Client,
    signal: ChangeSignal,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl FaviconFetcher {
    /// A concurrency of zero is treated as one.
    pub fn new(
        db: Database,
        client: reqwest::Client,
        signal: ChangeSignal,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            client,
            signal,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    /// Download and store one icon.
    ///
    /// Waits for a concurrency permit first.
    pub(crate) async fn fetch_one(&self, entry_id: &str, url: &str) -> Result<(), FaviconError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FaviconError::Closed)?;

        let bytes = tokio::time::timeout(self.timeout, self.download(url))
            .await
            .map_err(|_| FetchError::Timeout)??;

        if !self.db.upsert_favicon(entry_id, &bytes).await? {
            return Err(FaviconError::EntryGone);
        }
        self.signal.notify();
        tracing::debug!(entry_id = %entry_id, bytes = bytes.len(), "Stored favicon");
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FaviconError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()).into());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.starts_with("image/") {
            return Err(FaviconError::NotAnImage(content_type));
        }

        Ok(read_limited_bytes(response, MAX_FAVICON_SIZE).await?)
    }

    /// Fire-and-forget download of one icon; failures are only logged.
    pub fn spawn_fetch(&self, entry_id: String, url: String) -> JoinHandle<()> {
        let fetcher = self.clone();
        tokio::spawn(async move {
            match catch_task_panic(fetcher.fetch_one(&entry_id, &url)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(entry_id = %entry_id, url = %url, error = %e, "Favicon fetch failed");
                }
                Err(panic_msg) => {
                    tracing::error!(entry_id = %entry_id, error = %panic_msg, "Favicon task panicked");
                }
            }
        })
    }

    /// Start downloads for up to `limit` entries that lack icon bytes.
    ///
    /// Returns the task handles; callers may drop them.
    pub async fn fetch_missing(&self, limit: i64) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let missing = self.db.entries_missing_favicon(limit).await?;
        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), "Fetching missing favicons");
        }
        Ok(missing
            .into_iter()
            .map(|(entry_id, url)| self.spawn_fetch(entry_id, url))
            .collect())
    }
}
