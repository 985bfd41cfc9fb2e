//! AlertCast Engine Server
//!
//! Wires the delivery engine together: target set from a JSON file,
//! webhook adapter, dead-letter store, scheduler, fan-out publisher,
//! and lifecycle tasks, with Prometheus metrics exposed over HTTP.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AC_TARGETS_FILE` | - | Path to targets JSON file (required) |
//! | `AC_WORKERS` | `8` | Scheduler worker count |
//! | `AC_QUEUE_HIGH_CAPACITY` | `256` | High tier queue capacity |
//! | `AC_QUEUE_MEDIUM_CAPACITY` | `1024` | Medium tier queue capacity |
//! | `AC_QUEUE_LOW_CAPACITY` | `4096` | Low tier queue capacity |
//! | `AC_MAX_ATTEMPTS` | `3` | Delivery attempts before dead-lettering |
//! | `AC_RETRY_BASE_MS` | `500` | Base retry backoff |
//! | `AC_RETRY_MAX_MS` | `30000` | Retry backoff cap |
//! | `AC_ATTEMPT_TIMEOUT_MS` | `10000` | Per-attempt adapter timeout |
//! | `AC_BREAKER_FAILURE_THRESHOLD` | `5` | Failures before a circuit opens |
//! | `AC_BREAKER_SUCCESS_THRESHOLD` | `2` | Probe successes before it closes |
//! | `AC_BREAKER_COOLDOWN_MS` | `30000` | Open-state cooldown |
//! | `AC_TRACKER_CAPACITY` | `10000` | Job tracker LRU capacity |
//! | `AC_DLQ_BACKEND` | `memory` | DLQ backend: `memory`, `sqlite`, `postgres` |
//! | `AC_DLQ_DB_URL` | - | Database URL (required for sqlite/postgres) |
//! | `AC_DLQ_RETENTION_HOURS` | `168` | DLQ retention window |
//! | `AC_METRICS_PORT` | `9090` | Prometheus metrics port |
//! | `AC_DRAIN_TIMEOUT_SECS` | `30` | Graceful shutdown drain budget |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

use ac_common::{
    AdapterRegistry, HealthStatus, Target, TargetHealth, TargetHealthView, TargetProvider,
};
use ac_dlq::DeadLetterStore;
use ac_engine::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DeliveryDispatcher,
    DispatcherConfig, JobTracker, LifecycleConfig, LifecycleManager, PriorityScheduler,
    RetryPolicy, SchedulerConfig,
};
use ac_webhook::{WebhookAdapter, WebhookConfig};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

/// Fixed target set loaded at startup. Discovery and refresh live in a
/// separate layer; the engine only reads.
struct FileTargets {
    targets: Vec<Arc<Target>>,
}

impl FileTargets {
    fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading targets file {}: {}", path, e))?;
        let targets: Vec<Target> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing targets file {}: {}", path, e))?;
        Ok(Self {
            targets: targets.into_iter().map(Arc::new).collect(),
        })
    }
}

impl TargetProvider for FileTargets {
    fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.clone()
    }

    fn get(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.iter().find(|t| t.name == name).cloned()
    }
}

/// Health view derived from circuit state: open circuits read as
/// unhealthy, half-open as degraded.
struct BreakerHealthView {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl TargetHealthView for BreakerHealthView {
    fn health(&self, target_name: &str) -> TargetHealth {
        match self.breakers.get(target_name) {
            Some(breaker) => {
                let stats = breaker.stats();
                let status = match stats.state {
                    CircuitState::Closed => HealthStatus::Healthy,
                    CircuitState::HalfOpen => HealthStatus::Degraded,
                    CircuitState::Open => HealthStatus::Unhealthy,
                };
                TargetHealth {
                    status,
                    consecutive_failures: stats.consecutive_failures,
                }
            }
            None => TargetHealth::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting AlertCast Engine Server");

    let targets_file = env_required("AC_TARGETS_FILE")?;
    let metrics_port: u16 = env_or_parse("AC_METRICS_PORT", 9090);
    let drain_timeout_secs: u64 = env_or_parse("AC_DRAIN_TIMEOUT_SECS", 30);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| anyhow::anyhow!("metrics exporter: {}", e))?;
    info!("Metrics listening on http://{}/metrics", metrics_addr);

    let targets = Arc::new(FileTargets::load(&targets_file)?);
    info!(count = targets.targets.len(), "Targets loaded from {}", targets_file);

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(
        "webhook",
        Arc::new(
            WebhookAdapter::new(WebhookConfig::default())
                .map_err(|e| anyhow::anyhow!("webhook adapter: {}", e))?,
        ),
    );

    let dlq = create_dlq_store().await?;

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: env_or_parse("AC_BREAKER_FAILURE_THRESHOLD", 5),
        success_threshold: env_or_parse("AC_BREAKER_SUCCESS_THRESHOLD", 2),
        cooldown: Duration::from_millis(env_or_parse("AC_BREAKER_COOLDOWN_MS", 30_000)),
        half_open_max_probes: 2,
    }));

    let tracker = Arc::new(JobTracker::new(env_or_parse("AC_TRACKER_CAPACITY", 10_000)));

    let dispatcher = Arc::new(DeliveryDispatcher::new(
        adapters,
        breakers.clone(),
        dlq.clone(),
        tracker.clone(),
        DispatcherConfig {
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(env_or_parse("AC_RETRY_BASE_MS", 500)),
                max_delay: Duration::from_millis(env_or_parse("AC_RETRY_MAX_MS", 30_000)),
                jitter: 0.2,
                max_attempts: env_or_parse("AC_MAX_ATTEMPTS", 3),
            },
            attempt_timeout: Duration::from_millis(env_or_parse("AC_ATTEMPT_TIMEOUT_MS", 10_000)),
        },
    ));

    let scheduler = Arc::new(PriorityScheduler::new(
        SchedulerConfig {
            workers: env_or_parse("AC_WORKERS", 8),
            high_capacity: env_or_parse("AC_QUEUE_HIGH_CAPACITY", 256),
            medium_capacity: env_or_parse("AC_QUEUE_MEDIUM_CAPACITY", 1024),
            low_capacity: env_or_parse("AC_QUEUE_LOW_CAPACITY", 4096),
            idle_timeout: Duration::from_millis(100),
        },
        dispatcher.clone(),
        tracker,
        targets.clone(),
    ));
    scheduler.start();

    // Available to the API layer; the core loop only needs the scheduler
    let _publisher = ac_engine::FanOutPublisher::new(
        dispatcher,
        scheduler.clone(),
        Arc::new(BreakerHealthView {
            breakers: breakers.clone(),
        }),
    );
    let _replay = ac_dlq::DlqReplayService::new(dlq.clone(), scheduler.clone());

    let lifecycle = LifecycleManager::new();
    lifecycle.start(
        LifecycleConfig {
            dlq_retention: Duration::from_secs(
                env_or_parse("AC_DLQ_RETENTION_HOURS", 168u64) * 3600,
            ),
            ..Default::default()
        },
        dlq,
        breakers,
        scheduler.clone(),
    );

    info!("AlertCast Engine Server started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    scheduler
        .shutdown(Duration::from_secs(drain_timeout_secs))
        .await;
    lifecycle.shutdown().await;

    info!("AlertCast Engine Server shutdown complete");
    Ok(())
}

async fn create_dlq_store() -> Result<Arc<dyn DeadLetterStore>> {
    let backend = std::env::var("AC_DLQ_BACKEND").unwrap_or_else(|_| "memory".to_string());
    match backend.as_str() {
        "memory" => {
            info!("Using in-memory DLQ (entries do not survive restart)");
            Ok(Arc::new(ac_dlq::InMemoryDlqStore::new()))
        }
        "sqlite" => {
            let url = env_required("AC_DLQ_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let store = ac_dlq::SqliteDlqStore::new(pool);
            store.init_schema().await?;
            info!("Using SQLite DLQ: {}", url);
            Ok(Arc::new(store))
        }
        "postgres" => {
            let url = env_required("AC_DLQ_DB_URL")?;
            let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
            let store = ac_dlq::PostgresDlqStore::new(pool);
            store.init_schema().await?;
            info!("Using PostgreSQL DLQ");
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown DLQ backend: {}. Use memory, sqlite, or postgres",
            other
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
