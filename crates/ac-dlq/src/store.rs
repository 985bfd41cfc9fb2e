//! Dead-letter store contract and entry types.
//!
//! A DLQ entry is the durable snapshot of a job that failed terminally
//! (permanent error or retries exhausted). Entries are owned by the
//! store and mutated only through replay bookkeeping and purge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use ac_common::{ErrorType, Priority, PublishJob};

use crate::Result;

/// Durable snapshot of a terminally failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_name: String,
    /// Serialized alert payload, sufficient to resubmit the job
    pub alert: serde_json::Value,
    pub priority: Priority,
    pub error: String,
    pub error_type: ErrorType,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub replayed: bool,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_result: Option<String>,
}

impl DlqEntry {
    /// Build an entry from a job that reached a terminal failure.
    pub fn from_job(job: &PublishJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            target_name: job.target.name.clone(),
            alert: serde_json::to_value(job.alert.as_ref()).unwrap_or(serde_json::Value::Null),
            priority: job.priority,
            error: job
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            error_type: job.last_error_type,
            attempt_count: job.attempt_count,
            failed_at: Utc::now(),
            replayed: false,
            replayed_at: None,
            replay_result: None,
        }
    }
}

/// Outcome of a replay attempt, recorded on the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
    Resubmitted,
    SubmitFailed(String),
}

impl ReplayResult {
    pub fn as_str(&self) -> String {
        match self {
            ReplayResult::Resubmitted => "resubmitted".to_string(),
            ReplayResult::SubmitFailed(e) => format!("submit_failed: {}", e),
        }
    }
}

/// Read filters, paginated descending by failure time.
#[derive(Debug, Clone)]
pub struct DlqFilter {
    pub target_name: Option<String>,
    pub error_type: Option<ErrorType>,
    pub priority: Option<Priority>,
    pub replayed: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DlqFilter {
    fn default() -> Self {
        Self {
            target_name: None,
            error_type: None,
            priority: None,
            replayed: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl DlqFilter {
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(ref target) = self.target_name {
            if &entry.target_name != target {
                return false;
            }
        }
        if let Some(error_type) = self.error_type {
            if entry.error_type != error_type {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if entry.priority != priority {
                return false;
            }
        }
        if let Some(replayed) = self.replayed {
            if entry.replayed != replayed {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: u64,
    pub replayed: u64,
    pub transient: u64,
    pub permanent: u64,
    pub unknown: u64,
    pub oldest_failed_at: Option<DateTime<Utc>>,
}

/// Durable sink for terminally failed jobs.
///
/// `write` is invoked exactly once per job reaching terminal failure
/// and must never silently drop it. `purge` is the only deletion path.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn write(&self, entry: DlqEntry) -> Result<()>;

    async fn read(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>>;

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>>;

    /// Record the outcome of a replay. Fails with `AlreadyReplayed` if
    /// the entry was replayed before.
    async fn mark_replayed(&self, id: Uuid, result: ReplayResult) -> Result<()>;

    /// Delete entries older than the retention window; returns the
    /// number removed.
    async fn purge(&self, older_than: Duration) -> Result<u64>;

    async fn stats(&self) -> Result<DlqStats>;
}

// String round-trips shared by the sql backends.

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn priority_to_str(p: Priority) -> &'static str {
    p.as_str()
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn priority_from_str(s: &str) -> Priority {
    match s {
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Medium,
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn error_type_to_str(e: ErrorType) -> &'static str {
    e.as_str()
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn error_type_from_str(s: &str) -> ErrorType {
    match s {
        "transient" => ErrorType::Transient,
        "permanent" => ErrorType::Permanent,
        "unknown" => ErrorType::Unknown,
        _ => ErrorType::None,
    }
}
