// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no engine logic.
// The engine (domains/batched_migrations) receives implementations through
// EngineDeps so tests can swap in the doubles from test_dependencies.
//
// Naming convention: Base* for trait names (e.g., BaseClock, BaseConnection)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::common::Cursor;
use crate::domains::batched_migrations::models::{BatchedJob, BatchedMigration};

// =============================================================================
// Clock
// =============================================================================

pub trait BaseClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl BaseClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Connection (Infrastructure - read access to migrated tables)
// =============================================================================

#[async_trait]
pub trait BaseConnection: Send + Sync {
    /// Bounds of the next window of existing keys.
    ///
    /// Returns the first key `>= from` (and `<= upper` when given) together with
    /// the `size`-th key counted from it, or the last qualifying key when fewer
    /// than `size` keys remain. `None` when no key qualifies.
    async fn key_window(
        &self,
        table: &str,
        columns: &[String],
        from: &Cursor,
        upper: Option<&Cursor>,
        size: i64,
    ) -> Result<Option<(Cursor, Cursor)>>;

    /// Smallest existing key
    async fn min_key(&self, table: &str, columns: &[String]) -> Result<Option<Cursor>>;

    /// Largest existing key
    async fn max_key(&self, table: &str, columns: &[String]) -> Result<Option<Cursor>>;

    /// Planner estimate of the number of rows in `table`
    async fn estimate_row_count(&self, table: &str) -> Result<i64>;

    /// Underlying pool for job classes that write to Postgres
    fn pg_pool(&self) -> Option<&PgPool> {
        None
    }
}

// =============================================================================
// Error Tracking (Infrastructure)
// =============================================================================

pub trait BaseErrorTracker: Send + Sync {
    /// Report an exception together with a JSON object of context fields
    fn track_exception(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        context: serde_json::Value,
    );
}

// =============================================================================
// Metrics Sink (Infrastructure)
// =============================================================================

pub trait BaseMetricsSink: Send + Sync {
    /// Export the gauges, counters and timings of a finished job execution
    fn track(&self, job: &BatchedJob, migration: &BatchedMigration, migrated_tuple_count: i64);
}

/// Metrics sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl BaseMetricsSink for NoopMetricsSink {
    fn track(&self, _job: &BatchedJob, _migration: &BatchedMigration, _migrated_tuple_count: i64) {}
}
