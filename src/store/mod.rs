//! Postgres storage for chunks, graph, jobs, errors and metrics (sqlx async)
//!
//! One [`Store`] per process holding a connection pool (min 5 / max 10).
//! pgvector columns are bound as `$n::vector` literals and trigram matching
//! uses `pg_trgm similarity()`; both extensions are assumed present (see
//! `schema.sql`).
//!
//! ## Module structure
//!
//! - `chunks` - chunk upserts, reads, lexical and vector top-k legs
//! - `graph` - node/edge persistence and neighbor reads
//! - `errors` - append-only indexing error log
//! - `jobs` - batch job control records
//! - `memories` - auxiliary memory storage
//! - `metrics` - api_metrics / alerts row persistence

mod chunks;
mod errors;
mod graph;
mod jobs;
mod memories;
mod metrics;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

pub use chunks::{ChunkFilters, ScoredChunk, StoredChunk, VectorDomain};
pub use errors::{IndexingErrorRecord, NewIndexingError};
pub use graph::{Direction, NeighborEdge};
pub use jobs::{BatchJob, JobStatus};
pub use memories::Memory;
pub use metrics::AlertRow;

/// Store operation errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    Invalid(String),
}

/// Async Postgres store shared by the pipeline and the search engine.
///
/// Cloneable; clones share the underlying pool.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    /// Connect with the standard pool shape (min 5 / max 10 per process).
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(5)
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;

        tracing::info!("Database pool connected");
        Ok(Self { pool })
    }

    /// Apply the reference schema (idempotent). Production schemas are
    /// migrated externally; this backs local bootstrap and tests.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("schema.sql");
        for statement in schema.split(';') {
            let stmt: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::info!("Schema ensured");
        Ok(())
    }

    /// Health probe used behind the `relational_db_health` breaker.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
