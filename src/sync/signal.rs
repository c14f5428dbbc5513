//! Wake-ups for the change log merger.
//!
//! [`ChangeSignal`] is fired by in-process writers after a committed write.
//! [`LogWatcher`] covers writers in other processes by polling the change
//! log head and firing the same signal when it moves.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::storage::Database;

/// Coalescing "something changed" notification.
///
/// Backed by a watch channel: any number of notifications between two reads
/// of a receiver collapse into a single wake-up.
#[derive(Clone)]
pub struct ChangeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the log as changed. Never blocks, works with no subscribers.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls the change log head to notice writes made by other processes.
pub struct LogWatcher;

impl LogWatcher {
    /// Start polling every `interval`; the task runs until aborted.
    ///
    /// Read errors are logged and the poll is retried on the next tick.
    pub fn spawn(db: Database, signal: ChangeSignal, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_head: Option<Option<i64>> = None;

            loop {
                ticker.tick().await;
                match db.change_log_head().await {
                    Ok(head) => {
                        if last_head.is_some_and(|seen| seen != head) {
                            tracing::debug!(?head, "Change log head moved");
                            signal.notify();
                        }
                        last_head = Some(head);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll change log head");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogEntryDraft;

    #[tokio::test]
    async fn test_notifications_coalesce() {
        let signal = ChangeSignal::new();
        let mut rx = signal.subscribe();

        for _ in 0..5 {
            signal.notify();
        }

        rx.changed().await.unwrap();
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_notify_without_subscribers() {
        let signal = ChangeSignal::default();
        signal.notify();
        let rx = signal.subscribe();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_watcher_fires_on_head_move() {
        let db = Database::open(":memory:").await.unwrap();
        let signal = ChangeSignal::new();
        let mut rx = signal.subscribe();

        let handle = LogWatcher::spawn(db.clone(), signal.clone(), Duration::from_millis(10));
        // Let the watcher record the initial (empty) head
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rx.has_changed().unwrap());

        db.bulk_insert(vec![CatalogEntryDraft {
            id: "foreign".to_string(),
            name: "Foreign write".to_string(),
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

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("watcher should notice the write")
            .unwrap();
        handle.abort();
    }
}
