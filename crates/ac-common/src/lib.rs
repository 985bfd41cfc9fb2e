use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Alert & Target Types
// ============================================================================

/// A ready-to-publish alert. The engine treats the payload as opaque;
/// only `severity` and `status` feed the default priority mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub fingerprint: String,
    pub name: String,
    pub severity: String,
    pub status: AlertStatus,
    pub payload: serde_json::Value,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// Descriptor for a notification target. Refreshed by an external
/// discovery mechanism; the engine reads it and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// Adapter family key ("webhook", "slack", ...). Used only to
    /// resolve an adapter from the registry, never for branching.
    pub kind: String,
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
    /// Signing secret for HMAC-SHA256 payload signatures
    pub signing_secret: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
}

// ============================================================================
// Job Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Default priority mapping from alert severity and status.
/// Callers may supply their own policy instead.
pub fn default_priority(alert: &Alert) -> Priority {
    if alert.status == AlertStatus::Resolved {
        return Priority::Low;
    }
    match alert.severity.as_str() {
        "critical" => Priority::High,
        "info" => Priority::Low,
        _ => Priority::Medium,
    }
}

/// Job lifecycle states. Transitions are monotonic:
/// Queued -> Processing -> {Succeeded | Retrying -> Processing | Failed -> DeadLettered}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Processing,
    Retrying,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::DeadLettered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }
}

/// Classification of a delivery error, decided by the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    Transient,
    Permanent,
    Unknown,
    None,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transient => "transient",
            ErrorType::Permanent => "permanent",
            ErrorType::Unknown => "unknown",
            ErrorType::None => "none",
        }
    }
}

/// A single alert+target delivery unit flowing through the scheduler.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub id: Uuid,
    pub priority: Priority,
    pub state: JobState,
    pub alert: Arc<Alert>,
    pub target: Arc<Target>,
    pub attempt_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_type: ErrorType,
}

impl PublishJob {
    pub fn new(alert: Arc<Alert>, target: Arc<Target>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            state: JobState::Queued,
            alert,
            target,
            attempt_count: 0,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            last_error_type: ErrorType::None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            priority: self.priority,
            state: self.state,
            target_name: self.target.name.clone(),
            alert_name: self.alert.name.clone(),
            attempt_count: self.attempt_count,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_error: self.last_error.clone(),
            last_error_type: self.last_error_type,
        }
    }
}

/// Lightweight projection of a `PublishJob` for O(1) status lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub priority: Priority,
    pub state: JobState,
    pub target_name: String,
    pub alert_name: String,
    pub attempt_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_type: ErrorType,
}

// ============================================================================
// Fan-Out Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Success,
    Failed,
    Skipped,
}

/// Per-target outcome of a fan-out invocation.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target_name: String,
    pub status: TargetStatus,
    pub duration: Duration,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Aggregate of per-target outcomes for one alert. Created fresh per
/// fan-out invocation and never persisted by the engine.
#[derive(Debug, Clone)]
pub struct FanOutResult {
    pub outcomes: Vec<TargetOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
}

impl FanOutResult {
    pub fn from_outcomes(outcomes: Vec<TargetOutcome>) -> Self {
        let success_count = outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Success)
            .count();
        let failure_count = outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Failed)
            .count();
        let skipped_count = outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Skipped)
            .count();
        Self {
            outcomes,
            success_count,
            failure_count,
            skipped_count,
        }
    }

    /// Partial success is a normal outcome, not an error.
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0 && self.skipped_count == 0
    }
}

// ============================================================================
// Target Health Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Current health of a target as seen by the external health view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
}

impl Default for TargetHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
        }
    }
}

// ============================================================================
// External Collaborator Traits
// ============================================================================

/// Capability set every target family must implement. The engine is
/// polymorphic over this trait and never inspects concrete types.
/// Lifecycle operations default to `Unsupported` for targets without
/// an incident lifecycle.
#[async_trait]
pub trait TargetAdapter: Send + Sync {
    async fn deliver(&self, target: &Target, alert: &Alert) -> Result<(), DeliveryError>;

    async fn acknowledge(&self, _target: &Target, _alert: &Alert) -> Result<(), DeliveryError> {
        Err(DeliveryError::Unsupported("acknowledge"))
    }

    async fn resolve(&self, _target: &Target, _alert: &Alert) -> Result<(), DeliveryError> {
        Err(DeliveryError::Unsupported("resolve"))
    }

    async fn send_change_event(
        &self,
        _target: &Target,
        _alert: &Alert,
    ) -> Result<(), DeliveryError> {
        Err(DeliveryError::Unsupported("send_change_event"))
    }
}

/// Read-only supplier of the current target set, refreshed externally.
pub trait TargetProvider: Send + Sync {
    fn targets(&self) -> Vec<Arc<Target>>;
    fn get(&self, name: &str) -> Option<Arc<Target>>;
}

/// Per-target health as computed by an external health tracker. The
/// engine only consults this for fan-out skip decisions.
pub trait TargetHealthView: Send + Sync {
    fn health(&self, target_name: &str) -> TargetHealth;
}

/// Adapter lookup by target family key. Registration happens at wiring
/// time; the engine only ever resolves.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn TargetAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, adapter: Arc<dyn TargetAdapter>) {
        self.adapters.insert(kind.into(), adapter);
    }

    pub fn resolve(&self, target: &Target) -> Option<Arc<dyn TargetAdapter>> {
        self.adapters.get(&target.kind).map(|a| a.clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// A single delivery attempt failure. Carries enough structure for the
/// classifier; adapters map vendor errors into these variants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("circuit open for target {target}")]
    CircuitOpen { target: String },

    #[error("target misconfigured: {0}")]
    Configuration(String),

    #[error("delivery cancelled")]
    Cancelled,

    #[error("operation not supported by this target: {0}")]
    Unsupported(&'static str),

    #[error("adapter error: {0}")]
    Adapter(String),
}

impl DeliveryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Submission-time backpressure. Returned synchronously; the caller
/// decides whether to shed load or retry submission later.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("queue full for priority {priority:?} (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("engine is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: &str, status: AlertStatus) -> Alert {
        Alert {
            fingerprint: "fp-1".to_string(),
            name: "HighErrorRate".to_string(),
            severity: severity.to_string(),
            status,
            payload: serde_json::json!({}),
            starts_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_priority_mapping() {
        assert_eq!(
            default_priority(&alert("critical", AlertStatus::Firing)),
            Priority::High
        );
        assert_eq!(
            default_priority(&alert("warning", AlertStatus::Firing)),
            Priority::Medium
        );
        assert_eq!(
            default_priority(&alert("info", AlertStatus::Firing)),
            Priority::Low
        );
        assert_eq!(
            default_priority(&alert("critical", AlertStatus::Resolved)),
            Priority::Low
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn test_fanout_result_census() {
        let outcomes = vec![
            TargetOutcome {
                target_name: "a".into(),
                status: TargetStatus::Success,
                duration: Duration::from_millis(10),
                attempts: 1,
                error: None,
            },
            TargetOutcome {
                target_name: "b".into(),
                status: TargetStatus::Failed,
                duration: Duration::from_millis(20),
                attempts: 3,
                error: Some("HTTP 503".into()),
            },
            TargetOutcome {
                target_name: "c".into(),
                status: TargetStatus::Skipped,
                duration: Duration::ZERO,
                attempts: 0,
                error: None,
            },
        ];
        let result = FanOutResult::from_outcomes(outcomes);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.skipped_count, 1);
        assert!(!result.all_succeeded());
    }

    #[test]
    fn test_job_snapshot_projection() {
        let job = PublishJob::new(
            Arc::new(alert("critical", AlertStatus::Firing)),
            Arc::new(Target {
                name: "ops-webhook".into(),
                kind: "webhook".into(),
                endpoint: Some("http://localhost/hook".into()),
                auth_token: None,
                signing_secret: None,
                rate_limit_per_minute: None,
            }),
            Priority::High,
        );
        let snap = job.snapshot();
        assert_eq!(snap.id, job.id);
        assert_eq!(snap.state, JobState::Queued);
        assert_eq!(snap.target_name, "ops-webhook");
        assert_eq!(snap.attempt_count, 0);
        assert_eq!(snap.last_error_type, ErrorType::None);
    }

    #[test]
    fn test_adapter_registry_resolve() {
        struct NoopAdapter;

        #[async_trait]
        impl TargetAdapter for NoopAdapter {
            async fn deliver(&self, _t: &Target, _a: &Alert) -> Result<(), DeliveryError> {
                Ok(())
            }
        }

        let registry = AdapterRegistry::new();
        registry.register("webhook", Arc::new(NoopAdapter));

        let target = Target {
            name: "t".into(),
            kind: "webhook".into(),
            endpoint: None,
            auth_token: None,
            signing_secret: None,
            rate_limit_per_minute: None,
        };
        assert!(registry.resolve(&target).is_some());

        let unknown = Target {
            kind: "pagerduty".into(),
            ..target
        };
        assert!(registry.resolve(&unknown).is_none());
    }
}
