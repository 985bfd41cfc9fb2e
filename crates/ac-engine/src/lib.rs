//! AlertCast Delivery Engine
//!
//! Core alert delivery machinery:
//! - PriorityScheduler: three-tier bounded queues drained by a worker pool
//! - DeliveryDispatcher: the single-target attempt path (breaker, rate gate, adapter call)
//! - CircuitBreakerRegistry: per-target failure isolation with automatic recovery probing
//! - ErrorClassifier: maps delivery errors to transient/permanent/unknown
//! - RetryPolicy: exponential backoff with jitter and a bounded attempt budget
//! - JobTracker: bounded LRU cache of recent job snapshots for status queries
//! - FanOutPublisher: concurrent multi-target publishing with health gating
//! - LifecycleManager: DLQ purge, breaker sweep, and stats background tasks

pub mod breaker;
pub mod classifier;
pub mod dispatch;
pub mod fanout;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;
pub mod tracker;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState, Permit,
};
pub use classifier::classify;
pub use dispatch::{AttemptOutcome, DeliveryDispatcher, DispatcherConfig};
pub use fanout::{FanOutOptions, FanOutPublisher, HealthStrategy, RetryMode};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use retry::RetryPolicy;
pub use scheduler::{EngineStats, PriorityScheduler, SchedulerConfig};
pub use tracker::{JobFilter, JobTracker, DEFAULT_TRACKER_CAPACITY};
