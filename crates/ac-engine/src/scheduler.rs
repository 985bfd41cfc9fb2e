//! Priority scheduler and worker pool.
//!
//! Three bounded FIFO queues, one per priority tier, drained by a
//! fixed-size worker pool in strict High > Medium > Low order. Workers
//! park on a notify handle with a short idle timeout so an empty engine
//! neither busy-spins nor sleeps through a submission.
//!
//! Retries are resubmission, not in-place waiting: a failed attempt
//! spawns a timer task that re-enqueues the job after its backoff
//! delay, so a worker is never pinned waiting out a backoff window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ac_common::{
    Alert, ErrorType, JobSnapshot, Priority, PublishJob, SubmitError, Target, TargetProvider,
};
use ac_dlq::ReplaySink;

use crate::dispatch::{AttemptOutcome, DeliveryDispatcher};
use crate::tracker::{JobFilter, JobTracker};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// High drains fastest, so it stays small to bound burst latency
    pub high_capacity: usize,
    pub medium_capacity: usize,
    pub low_capacity: usize,
    /// How long an idle worker parks before re-checking from High
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            high_capacity: 256,
            medium_capacity: 1024,
            low_capacity: 4096,
            idle_timeout: Duration::from_millis(100),
        }
    }
}

/// Point-in-time engine counters for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub queued_high: usize,
    pub queued_medium: usize,
    pub queued_low: usize,
    /// Jobs accepted but not yet terminal, including retry waits
    pub pending: u64,
    pub submitted_total: u64,
    pub rejected_total: u64,
    pub tracked_jobs: usize,
}

struct Tier {
    queue: Mutex<VecDeque<PublishJob>>,
    capacity: usize,
}

impl Tier {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    high: Tier,
    medium: Tier,
    low: Tier,
    notify: Notify,
    /// Wakes retry timers early so shutdown never waits out a backoff
    stop_notify: Notify,
    /// Outstanding retry-timer tasks, joined at shutdown
    timers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Arc<DeliveryDispatcher>,
    tracker: Arc<JobTracker>,
    targets: Arc<dyn TargetProvider>,
    accepting: AtomicBool,
    /// Hard stop: workers exit without draining
    stopped: AtomicBool,
    /// Accepted jobs not yet terminal (queued, processing, retry-waiting)
    pending: AtomicU64,
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl SchedulerInner {
    fn tier(&self, priority: Priority) -> &Tier {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    fn pop_next(&self) -> Option<PublishJob> {
        for tier in [&self.high, &self.medium, &self.low] {
            if let Some(job) = tier.queue.lock().pop_front() {
                return Some(job);
            }
        }
        None
    }
}

pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityScheduler {
    pub fn new(
        config: SchedulerConfig,
        dispatcher: Arc<DeliveryDispatcher>,
        tracker: Arc<JobTracker>,
        targets: Arc<dyn TargetProvider>,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            high: Tier::new(config.high_capacity),
            medium: Tier::new(config.medium_capacity),
            low: Tier::new(config.low_capacity),
            config,
            notify: Notify::new(),
            stop_notify: Notify::new(),
            timers: Mutex::new(Vec::new()),
            dispatcher,
            tracker,
            targets,
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            submitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        });
        Self {
            inner,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent start is not supported; call
    /// once during wiring.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move {
                Self::run_worker(inner, worker_id).await;
            }));
        }
        info!(workers = self.inner.config.workers, "scheduler started");
    }

    /// Build and enqueue a job for one alert+target pair. Non-blocking:
    /// a full tier rejects immediately with `QueueFull`.
    pub fn submit_alert(
        &self,
        alert: Arc<Alert>,
        target: Arc<Target>,
        priority: Priority,
    ) -> Result<Uuid, SubmitError> {
        self.submit(PublishJob::new(alert, target, priority))
    }

    pub fn submit(&self, job: PublishJob) -> Result<Uuid, SubmitError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        let tier = inner.tier(job.priority);
        let id = job.id;
        {
            let mut queue = tier.queue.lock();
            if queue.len() >= tier.capacity {
                inner.rejected_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    "alertcast_submit_rejected_total",
                    "priority" => job.priority.as_str()
                )
                .increment(1);
                return Err(SubmitError::QueueFull {
                    priority: job.priority,
                    capacity: tier.capacity,
                });
            }
            inner.tracker.record(&job);
            queue.push_back(job);
        }

        inner.pending.fetch_add(1, Ordering::SeqCst);
        inner.submitted_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("alertcast_jobs_submitted_total").increment(1);
        inner.notify.notify_one();
        Ok(id)
    }

    async fn run_worker(inner: Arc<SchedulerInner>, worker_id: usize) {
        debug!(worker_id, "worker started");
        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            if let Some(job) = inner.pop_next() {
                Self::process(&inner, job).await;
                continue;
            }
            // Drained and no retry timer can re-enqueue: done
            if !inner.accepting.load(Ordering::SeqCst) && inner.pending.load(Ordering::SeqCst) == 0
            {
                break;
            }
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(inner.config.idle_timeout) => {}
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// One attempt for one job. A panic in the dispatch path is caught,
    /// the job is failed to the dead-letter store, and the worker loop
    /// keeps running.
    async fn process(inner: &Arc<SchedulerInner>, mut job: PublishJob) {
        let attempt = std::panic::AssertUnwindSafe(inner.dispatcher.attempt(&mut job))
            .catch_unwind()
            .await;

        match attempt {
            Ok(AttemptOutcome::Succeeded) | Ok(AttemptOutcome::DeadLettered) => {
                inner.pending.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(AttemptOutcome::Retry { delay }) => {
                let timer_inner = inner.clone();
                let handle = tokio::spawn(async move {
                    // Register for the stop signal before checking the
                    // flag so a concurrent shutdown cannot slip between
                    // the check and the sleep
                    let stop = timer_inner.stop_notify.notified();
                    tokio::pin!(stop);
                    stop.as_mut().enable();
                    if !timer_inner.stopped.load(Ordering::SeqCst) {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = &mut stop => {}
                        }
                    }
                    Self::requeue_retry(&timer_inner, job).await;
                });
                let mut timers = inner.timers.lock();
                timers.retain(|h| !h.is_finished());
                timers.push(handle);
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id = %job.id, target = %job.target.name, panic = %msg,
                    "worker caught panic during dispatch");
                job.last_error = Some(format!("internal panic: {}", msg));
                job.last_error_type = ErrorType::Unknown;
                inner.dispatcher.dead_letter(&mut job).await;
                inner.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Put a retrying job back on its tier after the backoff elapsed.
    /// Bypasses the capacity check: the job already holds an accepted
    /// slot, and rejecting it here would violate write-once DLQ
    /// semantics without a terminal transition.
    async fn requeue_retry(inner: &Arc<SchedulerInner>, mut job: PublishJob) {
        if inner.stopped.load(Ordering::SeqCst) {
            inner.dispatcher.fail_cancelled(&mut job).await;
            inner.pending.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let tier = inner.tier(job.priority);
        tier.queue.lock().push_back(job);
        inner.notify.notify_one();
    }

    /// Stop accepting, let workers drain queues and retry timers, then
    /// hard-stop and cancel whatever is left.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        inner.notify.notify_waiters();
        info!(pending = inner.pending.load(Ordering::SeqCst), "scheduler draining");

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while inner.pending.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = inner.pending.load(Ordering::SeqCst),
                    "drain timeout elapsed, cancelling remaining jobs"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        inner.stopped.store(true, Ordering::SeqCst);
        inner.notify.notify_waiters();
        inner.stop_notify.notify_waiters();

        // Wake retry timers and wait for them: a job waiting out its
        // backoff is cancelled to the dead-letter store, not lost when
        // the process exits
        let timers: Vec<_> = inner.timers.lock().drain(..).collect();
        for handle in timers {
            let _ = handle.await;
        }

        // Jobs still queued after the hard stop are failed, not dropped
        while let Some(mut job) = inner.pop_next() {
            inner.dispatcher.fail_cancelled(&mut job).await;
            inner.pending.fetch_sub(1, Ordering::SeqCst);
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }

    pub fn job_status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.tracker.get(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.inner.tracker.list(filter)
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            queued_high: inner.high.queue.lock().len(),
            queued_medium: inner.medium.queue.lock().len(),
            queued_low: inner.low.queue.lock().len(),
            pending: inner.pending.load(Ordering::SeqCst),
            submitted_total: inner.submitted_total.load(Ordering::Relaxed),
            rejected_total: inner.rejected_total.load(Ordering::Relaxed),
            tracked_jobs: inner.tracker.len(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }
}

/// Dead-letter replay feeds straight back into the scheduler. The
/// target is re-resolved by name so a replay picks up current target
/// configuration, not the one captured at failure time.
#[async_trait]
impl ReplaySink for PriorityScheduler {
    async fn resubmit(
        &self,
        alert: Arc<Alert>,
        target_name: &str,
        priority: Priority,
    ) -> Result<Uuid, String> {
        let target = self
            .inner
            .targets
            .get(target_name)
            .ok_or_else(|| format!("target not found: {}", target_name))?;
        self.submit_alert(alert, target, priority)
            .map_err(|e| e.to_string())
    }
}
