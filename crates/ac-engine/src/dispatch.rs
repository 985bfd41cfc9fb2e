//! Single-target delivery path.
//!
//! One attempt = breaker check, per-target rate gate, adapter call with
//! a per-attempt timeout, classification, then either success, a retry
//! decision, or dead-lettering. Both the scheduler workers and the
//! fan-out inline mode go through here so the two paths cannot drift.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::{debug, error, info};

use ac_common::{AdapterRegistry, DeliveryError, JobState, PublishJob, Target};
use ac_dlq::{DeadLetterStore, DlqEntry};

use crate::breaker::{CircuitBreakerRegistry, Permit};
use crate::classifier::classify;
use crate::retry::RetryPolicy;
use crate::tracker::JobTracker;

type TargetRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// What the caller should do with the job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Re-enqueue after the backoff delay
    Retry { delay: Duration },
    /// Terminal failure, already written to the dead-letter store
    DeadLettered,
}

pub struct DispatcherConfig {
    pub retry_policy: RetryPolicy,
    /// Hard cap on a single adapter call
    pub attempt_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

pub struct DeliveryDispatcher {
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<dyn DeadLetterStore>,
    tracker: Arc<JobTracker>,
    config: DispatcherConfig,
    limiters: DashMap<String, Arc<TargetRateLimiter>>,
}

impl DeliveryDispatcher {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        dlq: Arc<dyn DeadLetterStore>,
        tracker: Arc<JobTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            adapters,
            breakers,
            dlq,
            tracker,
            config,
            limiters: DashMap::new(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry_policy
    }

    /// Run one delivery attempt and advance the job's state machine.
    ///
    /// A circuit-open rejection consumes an attempt and classifies as
    /// transient, so rejected jobs still walk the normal backoff
    /// schedule without touching the target.
    pub async fn attempt(&self, job: &mut PublishJob) -> AttemptOutcome {
        job.state = JobState::Processing;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        self.tracker.record(job);

        job.attempt_count += 1;
        let result = self.try_deliver(job).await;

        match result {
            Ok(()) => {
                job.state = JobState::Succeeded;
                job.completed_at = Some(Utc::now());
                job.last_error = None;
                self.tracker.record(job);
                metrics::counter!(
                    "alertcast_jobs_succeeded_total",
                    "target" => job.target.name.clone()
                )
                .increment(1);
                debug!(
                    job_id = %job.id,
                    target = %job.target.name,
                    attempts = job.attempt_count,
                    "delivery succeeded"
                );
                AttemptOutcome::Succeeded
            }
            Err(err) => {
                let error_type = classify(&err);
                job.last_error = Some(err.to_string());
                job.last_error_type = error_type;

                let policy = &self.config.retry_policy;
                if policy.should_retry(job.attempt_count, error_type) {
                    // Delay indexed by completed attempts so the
                    // schedule starts at the base delay
                    let delay = policy.next_delay(job.attempt_count - 1);
                    job.state = JobState::Retrying;
                    self.tracker.record(job);
                    metrics::counter!(
                        "alertcast_jobs_retried_total",
                        "target" => job.target.name.clone()
                    )
                    .increment(1);
                    info!(
                        job_id = %job.id,
                        target = %job.target.name,
                        attempt = job.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "delivery failed, scheduling retry"
                    );
                    AttemptOutcome::Retry { delay }
                } else {
                    self.dead_letter(job).await;
                    AttemptOutcome::DeadLettered
                }
            }
        }
    }

    /// The attempt body: adapter resolution, breaker gate, rate gate,
    /// timed adapter call. Breaker counters move only when the target
    /// was actually called.
    async fn try_deliver(&self, job: &PublishJob) -> Result<(), DeliveryError> {
        let adapter = self.adapters.resolve(&job.target).ok_or_else(|| {
            DeliveryError::Configuration(format!(
                "no adapter registered for target kind '{}'",
                job.target.kind
            ))
        })?;

        let breaker = self.breakers.get_or_create(&job.target.name);
        if breaker.try_acquire() == Permit::Rejected {
            metrics::counter!(
                "alertcast_circuit_rejections_total",
                "target" => job.target.name.clone()
            )
            .increment(1);
            return Err(DeliveryError::CircuitOpen {
                target: job.target.name.clone(),
            });
        }

        self.rate_gate(&job.target).await;

        let call = adapter.deliver(&job.target, &job.alert);
        let result = match tokio::time::timeout(self.config.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(format!(
                "attempt exceeded {}ms",
                self.config.attempt_timeout.as_millis()
            ))),
        };

        match &result {
            Ok(()) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Wait for the target's rate limit, if it declares one.
    async fn rate_gate(&self, target: &Target) {
        let Some(rpm) = target.rate_limit_per_minute.and_then(NonZeroU32::new) else {
            return;
        };
        let limiter = self
            .limiters
            .entry(target.name.clone())
            .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))))
            .clone();
        limiter.until_ready().await;
    }

    /// Terminal failure path: mark `Failed`, persist the entry, then
    /// mark `DeadLettered`. A store write failure is the one error
    /// escalated to the operator, since the job's record may be lost.
    pub async fn dead_letter(&self, job: &mut PublishJob) {
        job.state = JobState::Failed;
        job.completed_at = Some(Utc::now());
        self.tracker.record(job);

        let entry = DlqEntry::from_job(job);
        match self.dlq.write(entry).await {
            Ok(()) => {
                job.state = JobState::DeadLettered;
                self.tracker.record(job);
                metrics::counter!(
                    "alertcast_jobs_dead_lettered_total",
                    "target" => job.target.name.clone()
                )
                .increment(1);
                info!(
                    job_id = %job.id,
                    target = %job.target.name,
                    attempts = job.attempt_count,
                    error_type = job.last_error_type.as_str(),
                    "job dead-lettered"
                );
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    target = %job.target.name,
                    error = %e,
                    "dead-letter write failed; failed job record may be lost"
                );
            }
        }
    }

    /// Terminal path for a job cancelled by shutdown or a fan-out
    /// deadline. Recorded once, with the cancellation as the error.
    pub async fn fail_cancelled(&self, job: &mut PublishJob) {
        job.last_error = Some(DeliveryError::Cancelled.to_string());
        job.last_error_type = classify(&DeliveryError::Cancelled);
        self.dead_letter(job).await;
    }
}
