//! In-memory migration store for tests and dry runs.
//!
//! Mirrors the semantics of the Postgres store, including the uniqueness of
//! unfinished migrations and lease expiry.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::error::EngineError;
use super::models::{
    BatchedJob, BatchedMigration, JobStatus, JobTransitionLog, MigrationIdentity,
    MigrationStatus, NewJob, NewMigration, NewTransitionLog,
};
use super::store::{JobCounts, MigrationStore};

#[derive(Default)]
struct State {
    migrations: BTreeMap<i64, BatchedMigration>,
    jobs: BTreeMap<i64, BatchedJob>,
    logs: Vec<JobTransitionLog>,
    next_migration_id: i64,
    next_job_id: i64,
    next_log_id: i64,
}

impl State {
    fn insert_job(&mut self, new: NewJob, now: DateTime<Utc>) -> BatchedJob {
        self.next_job_id += 1;
        let job = BatchedJob {
            id: self.next_job_id,
            batched_background_migration_id: new.batched_background_migration_id,
            min_cursor: new.min_cursor,
            max_cursor: new.max_cursor,
            batch_size: new.batch_size,
            sub_batch_size: new.sub_batch_size,
            pause_ms: new.pause_ms,
            status: new.status,
            attempts: new.attempts,
            metrics: serde_json::json!({}),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn jobs_of(&self, migration_id: i64) -> impl Iterator<Item = &BatchedJob> {
        self.jobs
            .values()
            .filter(move |job| job.batched_background_migration_id == migration_id)
    }
}

/// Store keeping all rows in process memory
#[derive(Default)]
pub struct InMemoryMigrationStore {
    state: RwLock<State>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all jobs, in id order
    pub fn jobs(&self) -> Vec<BatchedJob> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of all transition logs
    pub fn transition_logs(&self) -> Vec<JobTransitionLog> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .logs
            .clone()
    }

    fn modify_migration(
        &self,
        migration_id: i64,
        change: impl FnOnce(&mut BatchedMigration),
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stored = state
            .migrations
            .get_mut(&migration_id)
            .ok_or(EngineError::NotFound {
                record: "batched migration",
                id: migration_id,
            })?;
        change(stored);
        Ok(())
    }

    /// Overwrite a job row as is, for arranging test fixtures
    pub fn put_job(&self, job: BatchedJob) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.next_job_id = state.next_job_id.max(job.id);
        state.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn create_migration(&self, new: NewMigration, now: DateTime<Utc>) -> Result<BatchedMigration> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let identity = new.identity();
        let duplicate = state.migrations.values().any(|m| {
            !matches!(m.status, MigrationStatus::Finished | MigrationStatus::Finalized)
                && m.identity() == identity
        });
        if duplicate {
            return Err(EngineError::DuplicateMigration(identity.to_string()).into());
        }

        state.next_migration_id += 1;
        let migration = BatchedMigration {
            id: state.next_migration_id,
            job_class_name: new.job_class_name,
            batch_class_name: new.batch_class_name,
            table_name: new.table_name,
            column_name: new.column_name,
            cursor_columns: new.cursor_columns,
            job_arguments: new.job_arguments,
            schema_name: new.schema_name,
            min_cursor: new.min_cursor,
            max_cursor: new.max_cursor,
            batch_size: new.batch_size,
            sub_batch_size: new.sub_batch_size,
            max_batch_size: new.max_batch_size,
            interval_secs: new.interval_secs,
            pause_ms: new.pause_ms,
            status: new.status,
            total_tuple_count: new.total_tuple_count,
            started_at: (new.status == MigrationStatus::Active).then_some(now),
            finished_at: None,
            on_hold_until: None,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        state.migrations.insert(migration.id, migration.clone());
        Ok(migration)
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.migrations.get(&id).cloned())
    }

    async fn find_for_configuration(&self, identity: &MigrationIdentity) -> Result<Option<BatchedMigration>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .migrations
            .values()
            .rev()
            .find(|m| &m.identity() == identity)
            .cloned())
    }

    async fn list_migrations(&self) -> Result<Vec<BatchedMigration>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.migrations.values().cloned().collect())
    }

    async fn migrations_with_status(&self, status: MigrationStatus) -> Result<Vec<BatchedMigration>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .migrations
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect())
    }

    async fn executable_migrations(
        &self,
        schema_name: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BatchedMigration>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut tables = HashSet::new();

        Ok(state
            .migrations
            .values()
            .filter(|m| m.status == MigrationStatus::Active && !m.is_on_hold(now))
            .filter(|m| m.schema_name == schema_name)
            .filter(|m| tables.insert(m.table_name.clone()))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_migration(&self, migration: &BatchedMigration) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stored = state
            .migrations
            .get_mut(&migration.id)
            .ok_or(EngineError::NotFound {
                record: "batched migration",
                id: migration.id,
            })?;

        let lease_holder = stored.lease_holder.take();
        let lease_expires_at = stored.lease_expires_at.take();
        *stored = migration.clone();
        stored.lease_holder = lease_holder;
        stored.lease_expires_at = lease_expires_at;
        Ok(())
    }

    async fn update_on_hold_until(
        &self,
        migration_id: i64,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.modify_migration(migration_id, |stored| {
            stored.on_hold_until = Some(until);
            stored.updated_at = now;
        })
    }

    async fn update_batch_size(
        &self,
        migration_id: i64,
        batch_size: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.modify_migration(migration_id, |stored| {
            stored.batch_size = batch_size;
            stored.updated_at = now;
        })
    }

    async fn try_acquire_lease(
        &self,
        migration_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(migration) = state.migrations.get_mut(&migration_id) else {
            return Ok(false);
        };

        let free = match (&migration.lease_holder, migration.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(expires_at)) => expires_at <= now,
            (Some(_), None) => true,
        };
        if free {
            migration.lease_holder = Some(holder.to_string());
            migration.lease_expires_at = Some(now + ttl);
        }
        Ok(free)
    }

    async fn release_lease(&self, migration_id: i64, holder: &str) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(migration) = state.migrations.get_mut(&migration_id) {
            if migration.lease_holder.as_deref() == Some(holder) {
                migration.lease_holder = None;
                migration.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn create_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Ok(state.insert_job(new, now))
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &BatchedJob) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stored = state.jobs.get_mut(&job.id).ok_or(EngineError::NotFound {
            record: "batched job",
            id: job.id,
        })?;
        *stored = job.clone();
        Ok(())
    }

    async fn split_job(&self, narrowed: &BatchedJob, sibling: NewJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.jobs.contains_key(&narrowed.id) {
            return Err(EngineError::NotFound {
                record: "batched job",
                id: narrowed.id,
            }
            .into());
        }
        state.jobs.insert(narrowed.id, narrowed.clone());
        Ok(state.insert_job(sibling, now))
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<BatchedJob> = state.jobs_of(migration_id).cloned().collect();
        jobs.sort_by(|a, b| a.min_cursor.cmp(&b.min_cursor).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .max_by(|a, b| a.max_cursor.cmp(&b.max_cursor).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn stuck_jobs(&self, migration_id: i64, updated_before: DateTime<Utc>) -> Result<Vec<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Running && job.updated_at <= updated_before)
            .cloned()
            .collect())
    }

    async fn retriable_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<Vec<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<BatchedJob> = state
            .jobs_of(migration_id)
            .filter(|job| match job.status {
                JobStatus::Pending => true,
                JobStatus::Failed => job.attempts < max_attempts,
                _ => false,
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.min_cursor.cmp(&b.min_cursor).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn count_exhausted_jobs(&self, migration_id: i64, max_attempts: i32) -> Result<i64> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Failed && job.attempts >= max_attempts)
            .count() as i64)
    }

    async fn count_active_jobs(&self, migration_id: i64) -> Result<i64> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
            .count() as i64)
    }

    async fn count_failed_jobs(&self, migration_id: i64) -> Result<i64> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Failed)
            .count() as i64)
    }

    async fn successful_jobs_newest_first(&self, migration_id: i64, limit: i64) -> Result<Vec<BatchedJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<BatchedJob> = state
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Succeeded)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn job_counts_since(&self, migration_id: i64, since: DateTime<Utc>) -> Result<JobCounts> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<&BatchedJob> = state
            .jobs_of(migration_id)
            .filter(|job| job.created_at >= since)
            .collect();

        Ok(JobCounts {
            total: recent.len() as i64,
            failed: recent
                .iter()
                .filter(|job| job.status == JobStatus::Failed)
                .count() as i64,
        })
    }

    async fn migrated_tuple_count(&self, migration_id: i64) -> Result<i64> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Succeeded)
            .map(|job| job.batch_size)
            .sum())
    }

    async fn reset_failed_job_attempts(&self, migration_id: i64, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut reset = 0;
        for job in state.jobs.values_mut() {
            if job.batched_background_migration_id == migration_id && job.status == JobStatus::Failed {
                job.attempts = 0;
                job.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn insert_transition_log(&self, log: NewTransitionLog, now: DateTime<Utc>) -> Result<JobTransitionLog> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.next_log_id += 1;
        let row = JobTransitionLog {
            id: state.next_log_id,
            batched_background_migration_job_id: log.batched_background_migration_job_id,
            previous_status: log.previous_status,
            next_status: log.next_status,
            exception_class: log.exception_class,
            exception_message: log.exception_message,
            created_at: now,
        };
        state.logs.push(row.clone());
        Ok(row)
    }

    async fn transition_logs_for_job(&self, job_id: i64) -> Result<Vec<JobTransitionLog>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .logs
            .iter()
            .filter(|log| log.batched_background_migration_job_id == job_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Cursor;

    fn new_migration(table: &str) -> NewMigration {
        NewMigration::builder()
            .job_class_name("CopyColumn")
            .table_name(table)
            .column_name("id")
            .min_cursor(Cursor::single(1))
            .max_cursor(Cursor::single(100))
            .batch_size(10_i64)
            .sub_batch_size(5_i64)
            .interval_secs(120_i64)
            .build()
    }

    #[tokio::test]
    async fn rejects_duplicate_unfinished_migration() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();

        store.create_migration(new_migration("events"), now).await.unwrap();
        let err = store
            .create_migration(new_migration("events"), now)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::DuplicateMigration(_))
        ));
    }

    #[tokio::test]
    async fn allows_requeue_after_finish() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();

        let mut first = store.create_migration(new_migration("events"), now).await.unwrap();
        first.status = MigrationStatus::Finished;
        store.update_migration(&first).await.unwrap();

        let second = store.create_migration(new_migration("events"), now).await.unwrap();
        assert_ne!(first.id, second.id);

        let found = store
            .find_for_configuration(&second.identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn executable_migrations_returns_one_per_table() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();

        let first = store.create_migration(new_migration("events"), now).await.unwrap();
        let mut other_args = new_migration("events");
        other_args.job_arguments = serde_json::json!(["other"]);
        store.create_migration(other_args, now).await.unwrap();
        let users = store.create_migration(new_migration("users"), now).await.unwrap();

        let executable = store.executable_migrations("main", now, 10).await.unwrap();
        let ids: Vec<i64> = executable.iter().map(|m| m.id).collect();

        assert_eq!(ids, vec![first.id, users.id]);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();
        let m = store.create_migration(new_migration("events"), now).await.unwrap();
        let ttl = Duration::minutes(5);

        assert!(store.try_acquire_lease(m.id, "a", now, ttl).await.unwrap());
        assert!(!store.try_acquire_lease(m.id, "b", now, ttl).await.unwrap());
        assert!(store
            .try_acquire_lease(m.id, "b", now + Duration::minutes(6), ttl)
            .await
            .unwrap());

        store.release_lease(m.id, "b").await.unwrap();
        assert!(store.try_acquire_lease(m.id, "a", now, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn hold_and_batch_size_updates_keep_the_stored_status() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();
        let mut m = store.create_migration(new_migration("events"), now).await.unwrap();
        m.status = MigrationStatus::Paused;
        store.update_migration(&m).await.unwrap();

        let until = now + Duration::minutes(10);
        store.update_on_hold_until(m.id, until, now).await.unwrap();
        store.update_batch_size(m.id, 42, now).await.unwrap();

        let stored = store.find_migration(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Paused);
        assert_eq!(stored.on_hold_until, Some(until));
        assert_eq!(stored.batch_size, 42);
    }

    #[tokio::test]
    async fn update_migration_preserves_lease() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();
        let mut m = store.create_migration(new_migration("events"), now).await.unwrap();

        store
            .try_acquire_lease(m.id, "worker", now, Duration::minutes(5))
            .await
            .unwrap();
        m.batch_size = 20;
        store.update_migration(&m).await.unwrap();

        let stored = store.find_migration(m.id).await.unwrap().unwrap();
        assert_eq!(stored.batch_size, 20);
        assert_eq!(stored.lease_holder.as_deref(), Some("worker"));
    }
}
