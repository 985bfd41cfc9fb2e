use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::store::{
    error_type_from_str, error_type_to_str, priority_from_str, priority_to_str, DeadLetterStore,
    DlqEntry, DlqFilter, DlqStats, ReplayResult,
};
use crate::{DlqError, Result};

pub struct SqliteDlqStore {
    pool: SqlitePool,
}

impl SqliteDlqStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq_entries (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                target_name TEXT NOT NULL,
                alert TEXT NOT NULL,
                priority TEXT NOT NULL,
                error TEXT NOT NULL,
                error_type TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                failed_at BIGINT NOT NULL,
                replayed INTEGER NOT NULL DEFAULT 0,
                replayed_at BIGINT,
                replay_result TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dlq_failed_at ON dlq_entries(failed_at);
            CREATE INDEX IF NOT EXISTS idx_dlq_target ON dlq_entries(target_name);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DlqEntry> {
        let id: String = row.get("id");
        let job_id: String = row.get("job_id");
        let failed_at_ts: i64 = row.get("failed_at");
        let failed_at = DateTime::from_timestamp_millis(failed_at_ts)
            .ok_or_else(|| DlqError::Database("invalid failed_at timestamp".to_string()))?;
        let replayed_at: Option<i64> = row.get("replayed_at");
        let priority: String = row.get("priority");
        let error_type: String = row.get("error_type");

        Ok(DlqEntry {
            id: Uuid::parse_str(&id).map_err(|e| DlqError::Database(e.to_string()))?,
            job_id: Uuid::parse_str(&job_id).map_err(|e| DlqError::Database(e.to_string()))?,
            target_name: row.get("target_name"),
            alert: serde_json::from_str(row.get("alert"))?,
            priority: priority_from_str(&priority),
            error: row.get("error"),
            error_type: error_type_from_str(&error_type),
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            failed_at,
            replayed: row.get::<i64, _>("replayed") != 0,
            replayed_at: replayed_at.and_then(DateTime::from_timestamp_millis),
            replay_result: row.get("replay_result"),
        })
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDlqStore {
    async fn write(&self, entry: DlqEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries
                (id, job_id, target_name, alert, priority, error, error_type,
                 attempt_count, failed_at, replayed, replayed_at, replay_result)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.job_id.to_string())
        .bind(&entry.target_name)
        .bind(serde_json::to_string(&entry.alert)?)
        .bind(priority_to_str(entry.priority))
        .bind(&entry.error)
        .bind(error_type_to_str(entry.error_type))
        .bind(entry.attempt_count as i64)
        .bind(entry.failed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>> {
        let mut sql = String::from("SELECT * FROM dlq_entries WHERE 1=1");
        if filter.target_name.is_some() {
            sql.push_str(" AND target_name = ?");
        }
        if filter.error_type.is_some() {
            sql.push_str(" AND error_type = ?");
        }
        if filter.priority.is_some() {
            sql.push_str(" AND priority = ?");
        }
        if filter.replayed.is_some() {
            sql.push_str(" AND replayed = ?");
        }
        sql.push_str(" ORDER BY failed_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(ref target) = filter.target_name {
            query = query.bind(target);
        }
        if let Some(error_type) = filter.error_type {
            query = query.bind(error_type_to_str(error_type));
        }
        if let Some(priority) = filter.priority {
            query = query.bind(priority_to_str(priority));
        }
        if let Some(replayed) = filter.replayed {
            query = query.bind(replayed as i64);
        }
        query = query.bind(filter.limit as i64).bind(filter.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>> {
        let row = sqlx::query("SELECT * FROM dlq_entries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn mark_replayed(&self, id: Uuid, result: ReplayResult) -> Result<()> {
        // Guard against double replay in the update itself
        let updated = sqlx::query(
            r#"
            UPDATE dlq_entries
            SET replayed = 1, replayed_at = ?, replay_result = ?
            WHERE id = ? AND replayed = 0
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(result.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(_) => Err(DlqError::AlreadyReplayed(id)),
                None => Err(DlqError::NotFound(id)),
            };
        }
        Ok(())
    }

    async fn purge(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query("DELETE FROM dlq_entries WHERE failed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<DlqStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(replayed), 0) AS replayed,
                COALESCE(SUM(CASE WHEN error_type = 'transient' THEN 1 ELSE 0 END), 0) AS transient,
                COALESCE(SUM(CASE WHEN error_type = 'permanent' THEN 1 ELSE 0 END), 0) AS permanent,
                COALESCE(SUM(CASE WHEN error_type = 'unknown' THEN 1 ELSE 0 END), 0) AS unknown,
                MIN(failed_at) AS oldest_failed_at
            FROM dlq_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let oldest: Option<i64> = row.get("oldest_failed_at");
        Ok(DlqStats {
            total: row.get::<i64, _>("total") as u64,
            replayed: row.get::<i64, _>("replayed") as u64,
            transient: row.get::<i64, _>("transient") as u64,
            permanent: row.get::<i64, _>("permanent") as u64,
            unknown: row.get::<i64, _>("unknown") as u64,
            oldest_failed_at: oldest.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_common::{ErrorType, Priority};

    async fn store() -> SqliteDlqStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteDlqStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn entry(target: &str) -> DlqEntry {
        DlqEntry {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            target_name: target.to_string(),
            alert: serde_json::json!({"name": "HighErrorRate"}),
            priority: Priority::High,
            error: "HTTP 503: unavailable".to_string(),
            error_type: ErrorType::Transient,
            attempt_count: 3,
            failed_at: Utc::now(),
            replayed: false,
            replayed_at: None,
            replay_result: None,
        }
    }

    #[tokio::test]
    async fn test_write_get_roundtrip() {
        let store = store().await;
        let e = entry("slack");
        let id = e.id;
        store.write(e).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.target_name, "slack");
        assert_eq!(fetched.priority, Priority::High);
        assert_eq!(fetched.error_type, ErrorType::Transient);
        assert_eq!(fetched.attempt_count, 3);
        assert!(!fetched.replayed);
    }

    #[tokio::test]
    async fn test_filtered_read() {
        let store = store().await;
        store.write(entry("slack")).await.unwrap();
        store.write(entry("pagerduty")).await.unwrap();

        let filtered = store
            .read(&DlqFilter {
                target_name: Some("slack".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].target_name, "slack");
    }

    #[tokio::test]
    async fn test_double_replay_rejected() {
        let store = store().await;
        let e = entry("slack");
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
    }

    #[tokio::test]
    async fn test_purge_and_stats() {
        let store = store().await;
        let mut old = entry("slack");
        old.failed_at = Utc::now() - chrono::Duration::hours(72);
        store.write(old).await.unwrap();
        store.write(entry("slack")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);

        let removed = store.purge(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(removed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
