//! Persistence boundary of the engine.
//!
//! The domain computes every field (including timestamps, from the injected
//! clock); stores persist exactly what they are given. Implementations:
//! [`PostgresMigrationStore`](super::postgres_store::PostgresMigrationStore)
//! for production and
//! [`InMemoryMigrationStore`](super::memory_store::InMemoryMigrationStore)
//! for tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::models::{
    BatchedJob, BatchedMigration, JobTransitionLog, MigrationIdentity, MigrationStatus, NewJob,
    NewMigration, NewTransitionLog,
};

/// Job counts of one migration within a time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: i64,
    pub failed: i64,
}

#[async_trait]
pub trait MigrationStore: Send + Sync {
    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------

    /// Insert a migration. Fails with `EngineError::DuplicateMigration` when an
    /// unfinished migration with the same identity exists.
    async fn create_migration(&self, new: NewMigration, now: DateTime<Utc>) -> Result<BatchedMigration>;

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>>;

    /// Most recent migration with the given identity, in any status
    async fn find_for_configuration(&self, identity: &MigrationIdentity) -> Result<Option<BatchedMigration>>;

    /// All migrations in queue order (oldest first)
    async fn list_migrations(&self) -> Result<Vec<BatchedMigration>>;

    async fn migrations_with_status(&self, status: MigrationStatus) -> Result<Vec<BatchedMigration>>;

    /// Active migrations of `schema_name` that are not on hold at `now`, at
    /// most one per table (the oldest), in queue order
    async fn executable_migrations(
        &self,
        schema_name: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BatchedMigration>>;

    /// Persist the mutable columns of a migration. Lease columns are only
    /// written through `try_acquire_lease` and `release_lease`.
    async fn update_migration(&self, migration: &BatchedMigration) -> Result<()>;

    /// Write only `on_hold_until`, leaving concurrent status changes intact
    async fn update_on_hold_until(
        &self,
        migration_id: i64,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Write only `batch_size`, leaving concurrent status changes intact
    async fn update_batch_size(
        &self,
        migration_id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Take the execution lease of a migration when it is free or expired
    async fn try_acquire_lease(
        &self,
        migration_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release_lease(&self, migration_id: i64, holder: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn create_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<BatchedJob>;

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>>;

    async fn update_job(&self, job: &BatchedJob) -> Result<()>;

    /// Persist a narrowed job and insert its sibling in one transaction
    async fn split_job(&self, narrowed: &BatchedJob, sibling: NewJob, now: DateTime<Utc>) -> Result<BatchedJob>;

    /// Jobs of a migration ordered by `min_cursor`
    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>>;

    /// Job with the greatest `max_cursor`
    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>>;

    /// Running jobs whose `updated_at` is at or before `updated_before`
    async fn stuck_jobs(&self, migration_id: i64, updated_before: DateTime<Utc>) -> Result<Vec<BatchedJob>>;

    /// Pending jobs and failed jobs below `max_attempts`, ordered by `min_cursor`
    async fn retriable_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<Vec<BatchedJob>>;

    /// Failed jobs at or above `max_attempts`
    async fn count_exhausted_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<i64>;

    /// Pending or running jobs
    async fn count_active_jobs(&self, migration_id: i64) -> Result<i64>;

    async fn count_failed_jobs(&self, migration_id: i64) -> Result<i64>;

    /// Succeeded jobs, most recently finished first
    async fn successful_jobs_newest_first(&self, migration_id: i64, limit: i64) -> Result<Vec<BatchedJob>>;

    /// Jobs created at or after `since`
    async fn job_counts_since(&self, migration_id: i64, since: DateTime<Utc>) -> Result<JobCounts>;

    /// Sum of `batch_size` over succeeded jobs
    async fn migrated_tuple_count(&self, migration_id: i64) -> Result<i64>;

    /// Set `attempts = 0` on all failed jobs, returning how many were reset
    async fn reset_failed_job_attempts(&self, migration_id: i64, now: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Transition logs
    // ------------------------------------------------------------------

    async fn insert_transition_log(&self, log: NewTransitionLog, now: DateTime<Utc>) -> Result<JobTransitionLog>;

    /// Logs of one job, oldest first
    async fn transition_logs_for_job(&self, job_id: i64) -> Result<Vec<JobTransitionLog>>;
}
