//! Fan-out publishing: one alert, many targets.
//!
//! Each target is dispatched as its own task through the single-target
//! delivery path, bounded by a semaphore, with outcomes collected over
//! an mpsc channel. The aggregate result is a census, not a verdict:
//! partial success is a normal outcome, never an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use ac_common::{
    default_priority, Alert, FanOutResult, HealthStatus, Priority, PublishJob, Target,
    TargetHealthView, TargetOutcome, TargetStatus,
};

use crate::dispatch::{AttemptOutcome, DeliveryDispatcher};
use crate::scheduler::PriorityScheduler;

/// How target health gates dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStrategy {
    /// Ignore the health view entirely
    DispatchAll,
    SkipUnhealthy,
    SkipUnhealthyAndDegraded,
}

/// Where a failed dispatch retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Retry within the fan-out call; the result reflects the final
    /// outcome after backoff
    Inline,
    /// Report the first failure and hand the job to the scheduler for
    /// asynchronous retry
    Scheduler,
}

#[derive(Debug, Clone)]
pub struct FanOutOptions {
    pub max_concurrent: usize,
    /// Overall deadline for the whole batch
    pub timeout: Option<Duration>,
    pub health_strategy: HealthStrategy,
    pub retry_mode: RetryMode,
    /// Override the severity-derived priority
    pub priority: Option<Priority>,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            timeout: Some(Duration::from_secs(60)),
            health_strategy: HealthStrategy::SkipUnhealthy,
            retry_mode: RetryMode::Inline,
            priority: None,
        }
    }
}

pub struct FanOutPublisher {
    dispatcher: Arc<DeliveryDispatcher>,
    scheduler: Arc<PriorityScheduler>,
    health: Arc<dyn TargetHealthView>,
}

impl FanOutPublisher {
    pub fn new(
        dispatcher: Arc<DeliveryDispatcher>,
        scheduler: Arc<PriorityScheduler>,
        health: Arc<dyn TargetHealthView>,
    ) -> Self {
        Self {
            dispatcher,
            scheduler,
            health,
        }
    }

    /// Publish one alert to every target, concurrently. Returns once
    /// every dispatched target has reported; targets still in flight at
    /// the overall deadline are cancelled and reported as failed with a
    /// timeout error.
    pub async fn publish_to_targets(
        &self,
        alert: Arc<Alert>,
        targets: Vec<Arc<Target>>,
        options: FanOutOptions,
    ) -> FanOutResult {
        let priority = options
            .priority
            .unwrap_or_else(|| default_priority(&alert));
        let deadline = options
            .timeout
            .map(|t| tokio::time::Instant::now() + t);

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut dispatched = 0usize;
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        let (tx, mut rx) = mpsc::channel::<TargetOutcome>(targets.len().max(1));

        for target in targets {
            if self.should_skip(&target, options.health_strategy) {
                debug!(target = %target.name, "skipping unhealthy target");
                metrics::counter!(
                    "alertcast_fanout_skipped_total",
                    "target" => target.name.clone()
                )
                .increment(1);
                outcomes.push(TargetOutcome {
                    target_name: target.name.clone(),
                    status: TargetStatus::Skipped,
                    duration: Duration::ZERO,
                    attempts: 0,
                    error: None,
                });
                continue;
            }

            dispatched += 1;
            let dispatcher = self.dispatcher.clone();
            let scheduler = self.scheduler.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let alert = alert.clone();
            let retry_mode = options.retry_mode;

            tokio::spawn(async move {
                let outcome = Self::dispatch_one(
                    dispatcher, scheduler, semaphore, alert, target, priority, retry_mode,
                    deadline,
                )
                .await;
                // Receiver only drops if the publisher was itself dropped
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        for _ in 0..dispatched {
            match rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }

        let result = FanOutResult::from_outcomes(outcomes);
        metrics::counter!("alertcast_fanout_total").increment(1);
        if !result.all_succeeded() {
            warn!(
                alert = %alert.name,
                success = result.success_count,
                failed = result.failure_count,
                skipped = result.skipped_count,
                "fan-out completed with partial success"
            );
        }
        result
    }

    fn should_skip(&self, target: &Target, strategy: HealthStrategy) -> bool {
        let health = self.health.health(&target.name);
        match strategy {
            HealthStrategy::DispatchAll => false,
            HealthStrategy::SkipUnhealthy => health.status == HealthStatus::Unhealthy,
            HealthStrategy::SkipUnhealthyAndDegraded => matches!(
                health.status,
                HealthStatus::Unhealthy | HealthStatus::Degraded
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_one(
        dispatcher: Arc<DeliveryDispatcher>,
        scheduler: Arc<PriorityScheduler>,
        semaphore: Arc<Semaphore>,
        alert: Arc<Alert>,
        target: Arc<Target>,
        priority: Priority,
        retry_mode: RetryMode,
        deadline: Option<tokio::time::Instant>,
    ) -> TargetOutcome {
        let started = Instant::now();
        let mut job = PublishJob::new(alert, target, priority);

        let body = async {
            // Holding the permit across retries keeps the concurrency
            // bound honest for the whole per-target lifetime
            let _permit = semaphore.acquire().await;
            Self::deliver_with_mode(&dispatcher, &scheduler, &mut job, retry_mode).await
        };
        let completed = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, body).await.ok(),
            None => Some(body.await),
        };

        let result = match completed {
            Some(status) => status,
            None => {
                dispatcher.fail_cancelled(&mut job).await;
                (
                    TargetStatus::Failed,
                    Some("fan-out deadline exceeded".to_string()),
                )
            }
        };

        TargetOutcome {
            target_name: job.target.name.clone(),
            status: result.0,
            duration: started.elapsed(),
            attempts: job.attempt_count,
            error: result.1,
        }
    }

    async fn deliver_with_mode(
        dispatcher: &Arc<DeliveryDispatcher>,
        scheduler: &Arc<PriorityScheduler>,
        job: &mut PublishJob,
        retry_mode: RetryMode,
    ) -> (TargetStatus, Option<String>) {
        loop {
            match dispatcher.attempt(job).await {
                AttemptOutcome::Succeeded => return (TargetStatus::Success, None),
                AttemptOutcome::DeadLettered => {
                    return (TargetStatus::Failed, job.last_error.clone());
                }
                AttemptOutcome::Retry { delay } => match retry_mode {
                    RetryMode::Inline => {
                        tokio::time::sleep(delay).await;
                    }
                    RetryMode::Scheduler => {
                        let error = job.last_error.clone();
                        let mut handoff = job.clone();
                        let scheduler = scheduler.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            // A rejected handoff still gets its terminal
                            // transition; the job is never left Retrying
                            if let Err(e) = scheduler.submit(handoff.clone()) {
                                warn!(
                                    job_id = %handoff.id,
                                    error = %e,
                                    "async retry handoff rejected, dead-lettering"
                                );
                                dispatcher.dead_letter(&mut handoff).await;
                            }
                        });
                        return (TargetStatus::Failed, error);
                    }
                },
            }
        }
    }
}
