//! Dead-letter queue for the alert delivery engine.
//!
//! Jobs that exhaust their retries or hit a permanent error are written
//! here exactly once, with full error context preserved. Entries are
//! queryable, replayable (once), and deleted only by retention purge.
//!
//! Backends:
//! - `InMemoryDlqStore` - tests and embedded use
//! - `SqliteDlqStore` - single-node durability (feature `sqlite`)
//! - `PostgresDlqStore` - shared durability (feature `postgres`)

pub mod memory;
pub mod replay;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryDlqStore;
pub use replay::{DlqReplayService, ReplaySink};
pub use store::{DeadLetterStore, DlqEntry, DlqFilter, DlqStats, ReplayResult};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDlqStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDlqStore;

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ entry not found: {0}")]
    NotFound(Uuid),

    #[error("DLQ entry already replayed: {0}")]
    AlreadyReplayed(Uuid),

    #[error("replay submission rejected: {0}")]
    Submit(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for DlqError {
    fn from(e: sqlx::Error) -> Self {
        DlqError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DlqError>;
