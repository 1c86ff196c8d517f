//! Postgres implementation of [`MigrationStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use super::error::EngineError;
use super::models::{
    BatchedJob, BatchedMigration, JobTransitionLog, MigrationIdentity, MigrationStatus, NewJob,
    NewMigration, NewTransitionLog,
};
use super::store::{JobCounts, MigrationStore};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PostgresMigrationStore {
    pool: PgPool,
}

impl PostgresMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const INSERT_JOB: &str = r#"
    INSERT INTO batched_background_migration_jobs (
        batched_background_migration_id, min_cursor, max_cursor, batch_size,
        sub_batch_size, pause_ms, status, attempts, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
    RETURNING *
"#;

const UPDATE_JOB: &str = r#"
    UPDATE batched_background_migration_jobs
    SET min_cursor = $2,
        max_cursor = $3,
        batch_size = $4,
        sub_batch_size = $5,
        pause_ms = $6,
        status = $7,
        attempts = $8,
        metrics = $9,
        started_at = $10,
        finished_at = $11,
        updated_at = $12
    WHERE id = $1
"#;

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn create_migration(&self, new: NewMigration, now: DateTime<Utc>) -> Result<BatchedMigration> {
        let identity = new.identity();
        let started_at = (new.status == MigrationStatus::Active).then_some(now);

        let result = sqlx::query_as::<_, BatchedMigration>(
            r#"
            INSERT INTO batched_background_migrations (
                job_class_name, batch_class_name, table_name, column_name, cursor_columns,
                job_arguments, schema_name, min_cursor, max_cursor, batch_size, sub_batch_size,
                max_batch_size, interval_secs, pause_ms, status, total_tuple_count,
                started_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18)
            RETURNING *
            "#,
        )
        .bind(&new.job_class_name)
        .bind(&new.batch_class_name)
        .bind(&new.table_name)
        .bind(&new.column_name)
        .bind(&new.cursor_columns)
        .bind(&new.job_arguments)
        .bind(&new.schema_name)
        .bind(&new.min_cursor)
        .bind(&new.max_cursor)
        .bind(new.batch_size)
        .bind(new.sub_batch_size)
        .bind(new.max_batch_size)
        .bind(new.interval_secs)
        .bind(new.pause_ms)
        .bind(new.status)
        .bind(new.total_tuple_count)
        .bind(started_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(migration) => Ok(migration),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(EngineError::DuplicateMigration(identity.to_string()).into())
            }
            Err(e) => Err(e).context("failed to insert batched migration"),
        }
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        sqlx::query_as::<_, BatchedMigration>("SELECT * FROM batched_background_migrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn find_for_configuration(&self, identity: &MigrationIdentity) -> Result<Option<BatchedMigration>> {
        sqlx::query_as::<_, BatchedMigration>(
            r#"
            SELECT * FROM batched_background_migrations
            WHERE job_class_name = $1
              AND table_name = $2
              AND column_name = $3
              AND job_arguments = $4
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(&identity.job_class_name)
        .bind(&identity.table_name)
        .bind(&identity.column_name)
        .bind(&identity.job_arguments)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn list_migrations(&self) -> Result<Vec<BatchedMigration>> {
        sqlx::query_as::<_, BatchedMigration>("SELECT * FROM batched_background_migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn migrations_with_status(&self, status: MigrationStatus) -> Result<Vec<BatchedMigration>> {
        sqlx::query_as::<_, BatchedMigration>(
            "SELECT * FROM batched_background_migrations WHERE status = $1 ORDER BY id",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn executable_migrations(
        &self,
        schema_name: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BatchedMigration>> {
        sqlx::query_as::<_, BatchedMigration>(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (table_name) *
                FROM batched_background_migrations
                WHERE status = 'active'
                  AND schema_name = $1
                  AND (on_hold_until IS NULL OR on_hold_until <= $2)
                ORDER BY table_name, id
            ) executable
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(schema_name)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn update_migration(&self, migration: &BatchedMigration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET batch_size = $2,
                sub_batch_size = $3,
                max_batch_size = $4,
                interval_secs = $5,
                pause_ms = $6,
                status = $7,
                total_tuple_count = $8,
                started_at = $9,
                finished_at = $10,
                on_hold_until = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(migration.id)
        .bind(migration.batch_size)
        .bind(migration.sub_batch_size)
        .bind(migration.max_batch_size)
        .bind(migration.interval_secs)
        .bind(migration.pause_ms)
        .bind(migration.status)
        .bind(migration.total_tuple_count)
        .bind(migration.started_at)
        .bind(migration.finished_at)
        .bind(migration.on_hold_until)
        .bind(migration.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_on_hold_until(
        &self,
        migration_id: i64,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batched_background_migrations SET on_hold_until = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(migration_id)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_batch_size(
        &self,
        migration_id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batched_background_migrations SET batch_size = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(migration_id)
        .bind(batch_size)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        migration_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET lease_holder = $2,
                lease_expires_at = $3
            WHERE id = $1
              AND (lease_holder IS NULL
                   OR lease_holder = $2
                   OR lease_expires_at IS NULL
                   OR lease_expires_at <= $4)
            "#,
        )
        .bind(migration_id)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, migration_id: i64, holder: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET lease_holder = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(migration_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        sqlx::query_as::<_, BatchedJob>(INSERT_JOB)
            .bind(new.batched_background_migration_id)
            .bind(&new.min_cursor)
            .bind(&new.max_cursor)
            .bind(new.batch_size)
            .bind(new.sub_batch_size)
            .bind(new.pause_ms)
            .bind(new.status)
            .bind(new.attempts)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>("SELECT * FROM batched_background_migration_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn update_job(&self, job: &BatchedJob) -> Result<()> {
        sqlx::query(UPDATE_JOB)
            .bind(job.id)
            .bind(&job.min_cursor)
            .bind(&job.max_cursor)
            .bind(job.batch_size)
            .bind(job.sub_batch_size)
            .bind(job.pause_ms)
            .bind(job.status)
            .bind(job.attempts)
            .bind(&job.metrics)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn split_job(&self, narrowed: &BatchedJob, sibling: NewJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent splits of the same job
        sqlx::query("SELECT id FROM batched_background_migration_jobs WHERE id = $1 FOR UPDATE")
            .bind(narrowed.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(UPDATE_JOB)
            .bind(narrowed.id)
            .bind(&narrowed.min_cursor)
            .bind(&narrowed.max_cursor)
            .bind(narrowed.batch_size)
            .bind(narrowed.sub_batch_size)
            .bind(narrowed.pause_ms)
            .bind(narrowed.status)
            .bind(narrowed.attempts)
            .bind(&narrowed.metrics)
            .bind(narrowed.started_at)
            .bind(narrowed.finished_at)
            .bind(narrowed.updated_at)
            .execute(&mut *tx)
            .await?;

        let created = sqlx::query_as::<_, BatchedJob>(INSERT_JOB)
            .bind(sibling.batched_background_migration_id)
            .bind(&sibling.min_cursor)
            .bind(&sibling.max_cursor)
            .bind(sibling.batch_size)
            .bind(sibling.sub_batch_size)
            .bind(sibling.pause_ms)
            .bind(sibling.status)
            .bind(sibling.attempts)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>(
            r#"
            SELECT * FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
            ORDER BY min_cursor, id
            "#,
        )
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>(
            r#"
            SELECT * FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
            ORDER BY max_cursor DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(migration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn stuck_jobs(&self, migration_id: i64, updated_before: DateTime<Utc>) -> Result<Vec<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>(
            r#"
            SELECT * FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
              AND status = 'running'
              AND updated_at <= $2
            ORDER BY min_cursor, id
            "#,
        )
        .bind(migration_id)
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn retriable_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<Vec<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>(
            r#"
            SELECT * FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
              AND (status = 'pending' OR (status = 'failed' AND attempts < $2))
            ORDER BY min_cursor, id
            "#,
        )
        .bind(migration_id)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn count_exhausted_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
              AND status = 'failed'
              AND attempts >= $2
            "#,
        )
        .bind(migration_id)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn count_active_jobs(&self, migration_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn count_failed_jobs(&self, migration_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1 AND status = 'failed'
            "#,
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn successful_jobs_newest_first(&self, migration_id: i64, limit: i64) -> Result<Vec<BatchedJob>> {
        sqlx::query_as::<_, BatchedJob>(
            r#"
            SELECT * FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1 AND status = 'succeeded'
            ORDER BY finished_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(migration_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn job_counts_since(&self, migration_id: i64, since: DateTime<Utc>) -> Result<JobCounts> {
        let (total, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'failed')
            FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1 AND created_at >= $2
            "#,
        )
        .bind(migration_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobCounts { total, failed })
    }

    async fn migrated_tuple_count(&self, migration_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(batch_size), 0)::bigint
            FROM batched_background_migration_jobs
            WHERE batched_background_migration_id = $1 AND status = 'succeeded'
            "#,
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn reset_failed_job_attempts(&self, migration_id: i64, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET attempts = 0, updated_at = $2
            WHERE batched_background_migration_id = $1 AND status = 'failed'
            "#,
        )
        .bind(migration_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_transition_log(&self, log: NewTransitionLog, now: DateTime<Utc>) -> Result<JobTransitionLog> {
        sqlx::query_as::<_, JobTransitionLog>(
            r#"
            INSERT INTO batched_background_migration_job_transition_logs (
                batched_background_migration_job_id, previous_status, next_status,
                exception_class, exception_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(log.batched_background_migration_job_id)
        .bind(log.previous_status)
        .bind(log.next_status)
        .bind(log.exception_class)
        .bind(log.exception_message)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn transition_logs_for_job(&self, job_id: i64) -> Result<Vec<JobTransitionLog>> {
        sqlx::query_as::<_, JobTransitionLog>(
            r#"
            SELECT * FROM batched_background_migration_job_transition_logs
            WHERE batched_background_migration_job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
