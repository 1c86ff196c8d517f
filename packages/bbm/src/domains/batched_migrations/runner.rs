//! Runs batched migrations one job at a time.
//!
//! ```text
//! run_migration_job
//!     ├─► exhausted failed job?  ──► migration failed
//!     ├─► stuck running job      ──► re-run it
//!     ├─► pending / retriable    ──► re-run it
//!     ├─► next range             ──► create job, run it
//!     └─► nothing left           ──► finished (or failed when jobs failed)
//! ```
//!
//! Job failures are returned to the caller after the job and migration
//! bookkeeping is done.

use anyhow::Result;
use serde::Serialize;

use super::error::{EngineError, JobError};
use super::models::{BatchedJob, BatchedMigration, JobStatus, MigrationEvent, MigrationIdentity, MigrationStatus};
use super::optimizer::BatchOptimizer;
use super::wrapper;
use crate::kernel::EngineDeps;

/// Result of one attempt to make progress on a migration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// A job ran; `status` is where it ended up
    Executed { job_id: i64, status: JobStatus },
    Finished,
    Failed,
    /// Every range is covered but jobs are still pending or running
    AwaitingActiveJobs,
    /// Migration is not active or finalizing
    NotRunnable,
    IntervalNotElapsed,
    OnHold { until: chrono::DateTime<chrono::Utc> },
    /// Another worker holds the execution lease
    Locked,
    /// Running the migration returned an error
    Errored { message: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Adjust the batch size after a successful job
    pub optimize: bool,
}

#[derive(Clone)]
pub struct Runner {
    deps: EngineDeps,
}

impl Runner {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Make one step of progress on `migration`
    pub async fn run_migration_job(
        &self,
        migration: &mut BatchedMigration,
        options: RunOptions,
    ) -> Result<MigrationOutcome> {
        let deps = &self.deps;
        if !migration.status.is_executable() {
            return Ok(MigrationOutcome::NotRunnable);
        }

        let exhausted = deps
            .store
            .count_exhausted_jobs(migration.id, deps.settings.max_attempts)
            .await?;
        if exhausted > 0 {
            migration.transition(MigrationEvent::Failure, deps).await?;
            return Ok(MigrationOutcome::Failed);
        }

        let Some(mut job) = self.next_job(migration).await? else {
            return self.finish_active_migration(migration).await;
        };

        if let Err(e) = wrapper::perform(&mut job, deps).await {
            if e.downcast_ref::<JobError>().is_some() {
                self.after_failed_job(migration, &job).await?;
            }
            return Err(e);
        }

        if options.optimize {
            BatchOptimizer::new(deps).optimize(migration).await?;
        }

        Ok(MigrationOutcome::Executed {
            job_id: job.id,
            status: job.status,
        })
    }

    /// Run jobs until the migration is no longer active
    pub async fn run_entire_migration(&self, migration: &mut BatchedMigration) -> Result<MigrationStatus> {
        if migration.status != MigrationStatus::Active {
            return Ok(migration.status);
        }

        while migration.status == MigrationStatus::Active {
            match self.run_migration_job(migration, RunOptions::default()).await {
                Ok(MigrationOutcome::AwaitingActiveJobs) => break,
                Ok(_) => {}
                Err(e) => tolerate_job_failure(migration, e, "running migration")?,
            }
        }

        Ok(migration.status)
    }

    /// Run every active migration to completion, oldest first
    pub async fn execute_batched_migrations(&self) -> Result<Vec<(i64, MigrationStatus)>> {
        let migrations = self
            .deps
            .store
            .migrations_with_status(MigrationStatus::Active)
            .await?;

        let mut results = Vec::with_capacity(migrations.len());
        for mut migration in migrations {
            let status = self.run_entire_migration(&mut migration).await?;
            results.push((migration.id, status));
        }
        Ok(results)
    }

    /// Drive the migration with `identity` to `finished` synchronously.
    ///
    /// Returns `None` when no such migration exists. Fails with
    /// [`EngineError::FailedToFinalize`] when it cannot be completed.
    pub async fn finalize(&self, identity: &MigrationIdentity) -> Result<Option<BatchedMigration>> {
        let deps = &self.deps;
        let Some(mut migration) = deps.store.find_for_configuration(identity).await? else {
            tracing::warn!(
                configuration = %identity,
                "Could not find batched background migration for the given configuration"
            );
            return Ok(None);
        };

        if matches!(migration.status, MigrationStatus::Finished | MigrationStatus::Finalized) {
            tracing::warn!(
                batched_migration_id = migration.id,
                configuration = %identity,
                status = %migration.status,
                "Batched background migration for the given configuration is already finished"
            );
            return Ok(Some(migration));
        }

        deps.store
            .reset_failed_job_attempts(migration.id, deps.now())
            .await?;
        migration.transition(MigrationEvent::Finalize, deps).await?;

        while migration.status == MigrationStatus::Finalizing {
            match self.run_migration_job(&mut migration, RunOptions::default()).await {
                Ok(MigrationOutcome::AwaitingActiveJobs) => break,
                Ok(_) => {}
                Err(e) => tolerate_job_failure(&migration, e, "finalizing")?,
            }
        }

        if migration.status != MigrationStatus::Finished {
            return Err(EngineError::FailedToFinalize(migration.migration_identifier()).into());
        }
        Ok(Some(migration))
    }

    /// Job to run next: stuck, then retriable, then a new range
    async fn next_job(&self, migration: &BatchedMigration) -> Result<Option<BatchedJob>> {
        let deps = &self.deps;
        let settings = &deps.settings;

        let stuck_before = deps.now() - settings.stuck_jobs_timeout;
        if let Some(job) = deps.store.stuck_jobs(migration.id, stuck_before).await?.into_iter().next() {
            tracing::warn!(
                batched_job_id = job.id,
                batched_migration_id = migration.id,
                updated_at = %job.updated_at,
                "Retrying stuck batched job"
            );
            return Ok(Some(job));
        }

        if let Some(job) = deps
            .store
            .retriable_jobs(migration.id, settings.max_attempts)
            .await?
            .into_iter()
            .next()
        {
            return Ok(Some(job));
        }

        self.create_next_job(migration).await
    }

    /// Create the job for the range following the last job, `None` once the
    /// whole range is covered
    async fn create_next_job(&self, migration: &BatchedMigration) -> Result<Option<BatchedJob>> {
        let deps = &self.deps;
        let last_job = migration.last_job(deps).await?;
        let Some(min_cursor) = migration.next_min_cursor(last_job.as_ref()) else {
            return Ok(None);
        };
        if min_cursor > migration.max_cursor {
            return Ok(None);
        }

        let strategy = deps
            .registry
            .batching_strategy(&migration.batch_class_name, deps.connection.clone())?;
        let bounds = strategy
            .next_batch(
                &migration.table_name,
                &migration.batch_columns(),
                &min_cursor,
                migration.batch_size,
                &migration.job_arguments,
                &migration.job_class_name,
            )
            .await?;

        let Some((first, last)) = bounds else {
            return Ok(None);
        };
        if first > migration.max_cursor {
            return Ok(None);
        }

        // Jobs start where the previous one ended so ranges stay contiguous
        let max_cursor = last.min(migration.max_cursor.clone());
        let job = migration
            .create_batched_job(min_cursor, max_cursor, deps)
            .await?;
        Ok(Some(job))
    }

    async fn finish_active_migration(&self, migration: &mut BatchedMigration) -> Result<MigrationOutcome> {
        let deps = &self.deps;
        if deps.store.count_active_jobs(migration.id).await? > 0 {
            return Ok(MigrationOutcome::AwaitingActiveJobs);
        }

        if deps.store.count_failed_jobs(migration.id).await? > 0 {
            migration.transition(MigrationEvent::Failure, deps).await?;
            return Ok(MigrationOutcome::Failed);
        }

        migration.transition(MigrationEvent::Finish, deps).await?;
        Ok(MigrationOutcome::Finished)
    }

    /// Fail the migration when the job is out of attempts or too many jobs failed
    async fn after_failed_job(&self, migration: &mut BatchedMigration, job: &BatchedJob) -> Result<()> {
        let deps = &self.deps;
        let exhausted =
            job.status == JobStatus::Failed && job.attempts_exhausted(deps.settings.max_attempts);

        if exhausted || migration.should_stop(deps).await? {
            migration.transition(MigrationEvent::Failure, deps).await?;
        }
        Ok(())
    }
}

/// Job failures are already recorded on the job and retried by the next
/// iteration; any other error is returned.
fn tolerate_job_failure(migration: &BatchedMigration, error: anyhow::Error, during: &str) -> Result<()> {
    if error.downcast_ref::<JobError>().is_none() {
        return Err(error);
    }

    tracing::warn!(
        batched_migration_id = migration.id,
        error = %error,
        "Batched migration job failed while {}",
        during
    );
    Ok(())
}
