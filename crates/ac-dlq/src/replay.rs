//! DLQ replay coordination.
//!
//! Replay re-submits a dead-lettered alert+target pair through a
//! `ReplaySink` (implemented by the scheduler) and records the outcome
//! on the entry. An entry can be replayed at most once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use ac_common::{Alert, Priority};

use crate::store::{DeadLetterStore, DlqEntry, ReplayResult};
use crate::{DlqError, Result};

/// Resubmission seam. The scheduler implements this so the DLQ crate
/// stays free of an engine dependency.
#[async_trait]
pub trait ReplaySink: Send + Sync {
    /// Submit the alert for delivery to the named target. Returns the
    /// new job id, or a reason the submission was not accepted.
    async fn resubmit(
        &self,
        alert: Arc<Alert>,
        target_name: &str,
        priority: Priority,
    ) -> std::result::Result<Uuid, String>;
}

pub struct DlqReplayService {
    store: Arc<dyn DeadLetterStore>,
    sink: Arc<dyn ReplaySink>,
}

impl DlqReplayService {
    pub fn new(store: Arc<dyn DeadLetterStore>, sink: Arc<dyn ReplaySink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Replay a single entry. Rejected if the entry is unknown or was
    /// already replayed. A failed resubmission (e.g. queue full) leaves
    /// the entry unreplayed so the operator can try again.
    pub async fn replay(&self, id: Uuid) -> Result<Uuid> {
        let entry = self.store.get(id).await?.ok_or(DlqError::NotFound(id))?;
        if entry.replayed {
            return Err(DlqError::AlreadyReplayed(id));
        }

        let alert: Alert = serde_json::from_value(entry.alert.clone())?;

        match self
            .sink
            .resubmit(Arc::new(alert), &entry.target_name, entry.priority)
            .await
        {
            Ok(job_id) => {
                self.store
                    .mark_replayed(id, ReplayResult::Resubmitted)
                    .await?;
                info!(
                    entry_id = %id,
                    job_id = %job_id,
                    target = %entry.target_name,
                    "DLQ entry replayed"
                );
                metrics::counter!("alertcast_dlq_replayed_total").increment(1);
                Ok(job_id)
            }
            Err(reason) => {
                warn!(
                    entry_id = %id,
                    target = %entry.target_name,
                    reason = %reason,
                    "DLQ replay submission rejected"
                );
                Err(DlqError::Submit(reason))
            }
        }
    }

    /// Replay every entry matching the default filter that has not been
    /// replayed yet. Returns (replayed, failed) counts.
    pub async fn replay_all_pending(&self, limit: usize) -> Result<(usize, usize)> {
        let filter = crate::store::DlqFilter {
            replayed: Some(false),
            limit,
            ..Default::default()
        };
        let entries: Vec<DlqEntry> = self.store.read(&filter).await?;

        let mut replayed = 0;
        let mut failed = 0;
        for entry in entries {
            match self.replay(entry.id).await {
                Ok(_) => replayed += 1,
                Err(DlqError::AlreadyReplayed(_)) => {}
                Err(_) => failed += 1,
            }
        }
        Ok((replayed, failed))
    }
}
