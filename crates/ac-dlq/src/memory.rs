//! In-memory dead-letter store for tests and embedded use.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use ac_common::ErrorType;

use crate::store::{DeadLetterStore, DlqEntry, DlqFilter, DlqStats, ReplayResult};
use crate::{DlqError, Result};

#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<HashMap<Uuid, DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDlqStore {
    async fn write(&self, entry: DlqEntry) -> Result<()> {
        self.entries.write().insert(entry.id, entry);
        Ok(())
    }

    async fn read(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>> {
        let entries = self.entries.read();
        let mut matched: Vec<DlqEntry> = entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Newest failures first
        matched.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn mark_replayed(&self, id: Uuid, result: ReplayResult) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.replayed {
            return Err(DlqError::AlreadyReplayed(id));
        }
        entry.replayed = true;
        entry.replayed_at = Some(Utc::now());
        entry.replay_result = Some(result.as_str());
        Ok(())
    }

    async fn purge(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| DlqError::Database(e.to_string()))?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.failed_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> Result<DlqStats> {
        let entries = self.entries.read();
        let mut stats = DlqStats {
            total: entries.len() as u64,
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.replayed {
                stats.replayed += 1;
            }
            match entry.error_type {
                ErrorType::Transient => stats.transient += 1,
                ErrorType::Permanent => stats.permanent += 1,
                ErrorType::Unknown => stats.unknown += 1,
                ErrorType::None => {}
            }
            if stats
                .oldest_failed_at
                .map(|oldest| entry.failed_at < oldest)
                .unwrap_or(true)
            {
                stats.oldest_failed_at = Some(entry.failed_at);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_common::Priority;

    fn entry(target: &str, error_type: ErrorType) -> DlqEntry {
        DlqEntry {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            target_name: target.to_string(),
            alert: serde_json::json!({"name": "test"}),
            priority: Priority::Medium,
            error: "HTTP 503: unavailable".to_string(),
            error_type,
            attempt_count: 3,
            failed_at: Utc::now(),
            replayed: false,
            replayed_at: None,
            replay_result: None,
        }
    }

    #[tokio::test]
    async fn test_write_and_read_with_filters() {
        let store = InMemoryDlqStore::new();
        store.write(entry("slack", ErrorType::Transient)).await.unwrap();
        store.write(entry("slack", ErrorType::Permanent)).await.unwrap();
        store.write(entry("pagerduty", ErrorType::Transient)).await.unwrap();

        let all = store.read(&DlqFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let slack_only = store
            .read(&DlqFilter {
                target_name: Some("slack".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(slack_only.len(), 2);

        let transient = store
            .read(&DlqFilter {
                error_type: Some(ErrorType::Transient),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(transient.len(), 2);
    }

    #[tokio::test]
    async fn test_read_pagination_newest_first() {
        let store = InMemoryDlqStore::new();
        for i in 0..5 {
            let mut e = entry("slack", ErrorType::Transient);
            e.failed_at = Utc::now() - chrono::Duration::seconds(i);
            store.write(e).await.unwrap();
        }

        let page = store
            .read(&DlqFilter {
                limit: 2,
                offset: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].failed_at >= page[1].failed_at);

        let next = store
            .read(&DlqFilter {
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(next.len(), 2);
        assert!(page[1].failed_at >= next[0].failed_at);
    }

    #[tokio::test]
    async fn test_mark_replayed_rejects_double_replay() {
        let store = InMemoryDlqStore::new();
        let e = entry("slack", ErrorType::Transient);
        let id = e.id;
        store.write(e).await.unwrap();

        store
            .mark_replayed(id, ReplayResult::Resubmitted)
            .await
            .unwrap();

        let err = store
            .mark_replayed(id, ReplayResult::Resubmitted)
            .await
            .unwrap_err();
        assert!(matches!(err, DlqError::AlreadyReplayed(_)));

        let stored = store.get(id).await.unwrap().unwrap();
        assert!(stored.replayed);
        assert_eq!(stored.replay_result.as_deref(), Some("resubmitted"));
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_entries() {
        let store = InMemoryDlqStore::new();
        let mut old = entry("slack", ErrorType::Transient);
        old.failed_at = Utc::now() - chrono::Duration::hours(48);
        store.write(old).await.unwrap();
        store.write(entry("slack", ErrorType::Transient)).await.unwrap();

        let removed = store.purge(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryDlqStore::new();
        store.write(entry("slack", ErrorType::Transient)).await.unwrap();
        store.write(entry("slack", ErrorType::Permanent)).await.unwrap();
        let e = entry("pagerduty", ErrorType::Unknown);
        let id = e.id;
        store.write(e).await.unwrap();
        store
            .mark_replayed(id, ReplayResult::Resubmitted)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.transient, 1);
        assert_eq!(stats.permanent, 1);
        assert_eq!(stats.unknown, 1);
        assert!(stats.oldest_failed_at.is_some());
    }
}
