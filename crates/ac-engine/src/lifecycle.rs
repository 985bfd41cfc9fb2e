//! Background maintenance tasks.
//!
//! Owns the periodic work the hot path must not do: purging the
//! dead-letter store past its retention window, sweeping circuit
//! breakers whose cooldown elapsed with no traffic, and logging an
//! engine stats line. All tasks stop on a broadcast shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use ac_dlq::DeadLetterStore;

use crate::breaker::CircuitBreakerRegistry;
use crate::scheduler::PriorityScheduler;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// DLQ entries older than this are purged
    pub dlq_retention: Duration,
    pub dlq_purge_interval: Duration,
    pub breaker_sweep_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dlq_retention: Duration::from_secs(7 * 24 * 3600),
            dlq_purge_interval: Duration::from_secs(3600),
            breaker_sweep_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(
        &self,
        config: LifecycleConfig,
        dlq: Arc<dyn DeadLetterStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        scheduler: Arc<PriorityScheduler>,
    ) {
        let mut handles = self.handles.lock();

        handles.push(tokio::spawn(Self::run_purge(
            config.dlq_purge_interval,
            config.dlq_retention,
            dlq.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(Self::run_breaker_sweep(
            config.breaker_sweep_interval,
            breakers.clone(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(Self::run_stats(
            config.stats_interval,
            dlq,
            breakers,
            scheduler,
            self.shutdown_tx.subscribe(),
        )));
        info!("lifecycle tasks started");
    }

    async fn run_purge(
        interval: Duration,
        retention: Duration,
        dlq: Arc<dyn DeadLetterStore>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would purge at startup; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match dlq.purge(retention).await {
                        Ok(0) => {}
                        Ok(count) => {
                            info!(count, "purged expired dead-letter entries");
                            metrics::counter!("alertcast_dlq_purged_total").increment(count);
                        }
                        Err(e) => error!(error = %e, "dead-letter purge failed"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_breaker_sweep(
        interval: Duration,
        breakers: Arc<CircuitBreakerRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => breakers.sweep_all(),
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_stats(
        interval: Duration,
        dlq: Arc<dyn DeadLetterStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        scheduler: Arc<PriorityScheduler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = scheduler.stats();
                    metrics::gauge!("alertcast_queue_depth", "priority" => "high")
                        .set(stats.queued_high as f64);
                    metrics::gauge!("alertcast_queue_depth", "priority" => "medium")
                        .set(stats.queued_medium as f64);
                    metrics::gauge!("alertcast_queue_depth", "priority" => "low")
                        .set(stats.queued_low as f64);
                    metrics::gauge!("alertcast_pending_jobs").set(stats.pending as f64);

                    let dlq_total = match dlq.stats().await {
                        Ok(s) => s.total,
                        Err(e) => {
                            error!(error = %e, "dead-letter stats failed");
                            0
                        }
                    };
                    let open_circuits = breakers
                        .stats_all()
                        .iter()
                        .filter(|b| b.state != crate::breaker::CircuitState::Closed)
                        .count();
                    info!(
                        queued_high = stats.queued_high,
                        queued_medium = stats.queued_medium,
                        queued_low = stats.queued_low,
                        pending = stats.pending,
                        submitted = stats.submitted_total,
                        rejected = stats.rejected_total,
                        dlq_total,
                        open_circuits,
                        "engine stats"
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("lifecycle tasks stopped");
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::dispatch::{DeliveryDispatcher, DispatcherConfig};
    use crate::scheduler::SchedulerConfig;
    use crate::tracker::JobTracker;
    use ac_common::{AdapterRegistry, ErrorType, Priority, Target, TargetProvider};
    use ac_dlq::{DlqEntry, DlqFilter, InMemoryDlqStore};
    use chrono::Utc;
    use uuid::Uuid;

    struct NoTargets;

    impl TargetProvider for NoTargets {
        fn targets(&self) -> Vec<Arc<Target>> {
            Vec::new()
        }

        fn get(&self, _name: &str) -> Option<Arc<Target>> {
            None
        }
    }

    fn scheduler(dlq: Arc<InMemoryDlqStore>) -> Arc<PriorityScheduler> {
        let tracker = Arc::new(JobTracker::new(100));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::new(AdapterRegistry::new()),
            Arc::new(CircuitBreakerRegistry::default()),
            dlq,
            tracker.clone(),
            DispatcherConfig::default(),
        ));
        Arc::new(PriorityScheduler::new(
            SchedulerConfig {
                workers: 0,
                ..Default::default()
            },
            dispatcher,
            tracker,
            Arc::new(NoTargets),
        ))
    }

    fn old_entry(age: Duration) -> DlqEntry {
        DlqEntry {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            target_name: "ops".into(),
            alert: serde_json::json!({}),
            priority: Priority::Medium,
            error: "HTTP 503".into(),
            error_type: ErrorType::Transient,
            attempt_count: 3,
            failed_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
            replayed: false,
            replayed_at: None,
            replay_result: None,
        }
    }

    #[tokio::test]
    async fn test_purge_task_removes_expired_entries() {
        let dlq = Arc::new(InMemoryDlqStore::new());
        dlq.write(old_entry(Duration::from_secs(3600))).await.unwrap();
        dlq.write(old_entry(Duration::ZERO)).await.unwrap();

        let manager = LifecycleManager::new();
        manager.start(
            LifecycleConfig {
                dlq_retention: Duration::from_secs(60),
                dlq_purge_interval: Duration::from_millis(20),
                breaker_sweep_interval: Duration::from_secs(60),
                stats_interval: Duration::from_secs(60),
            },
            dlq.clone(),
            Arc::new(CircuitBreakerRegistry::default()),
            scheduler(dlq.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        let remaining = dlq.read(&DlqFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_sweep_promotes_cooled_circuits() {
        let dlq = Arc::new(InMemoryDlqStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            ..Default::default()
        }));
        let breaker = breakers.get_or_create("ops");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let manager = LifecycleManager::new();
        manager.start(
            LifecycleConfig {
                breaker_sweep_interval: Duration::from_millis(20),
                dlq_purge_interval: Duration::from_secs(60),
                stats_interval: Duration::from_secs(60),
                ..Default::default()
            },
            dlq.clone(),
            breakers.clone(),
            scheduler(dlq),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
