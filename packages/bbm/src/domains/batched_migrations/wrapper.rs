//! Executes one batched job through its job class.

use anyhow::Result;

use super::error::{EngineError, JobError};
use super::job_class::{BatchMetrics, JobArguments};
use super::models::{BatchedJob, BatchedMigration};
use crate::kernel::EngineDeps;

/// Arguments handed to the job class for `job`
pub fn job_arguments(job: &BatchedJob, migration: &BatchedMigration, deps: &EngineDeps) -> JobArguments {
    JobArguments {
        start_cursor: job.min_cursor.clone(),
        end_cursor: job.max_cursor.clone(),
        batch_table: migration.table_name.clone(),
        batch_column: migration.column_name.clone(),
        batch_columns: migration.batch_columns(),
        sub_batch_size: job.sub_batch_size,
        pause_ms: job.pause_ms,
        job_arguments: migration.job_arguments.clone(),
        connection: deps.connection.clone(),
    }
}

/// Run `job` once.
///
/// The job goes `running` and then `succeeded` or `failed`. Batch metrics
/// are stored on the job and reported to the metrics sink either way. A job
/// class failure is returned as a [`JobError`] after the bookkeeping is done,
/// sub-batch failures unwrapped first; bookkeeping errors are returned as-is.
pub async fn perform(job: &mut BatchedJob, deps: &EngineDeps) -> Result<()> {
    let migration = deps
        .store
        .find_migration(job.batched_background_migration_id)
        .await?
        .ok_or(EngineError::NotFound {
            record: "batched migration",
            id: job.batched_background_migration_id,
        })?;

    job.run(deps).await?;

    let (outcome, metrics) = execute(job, &migration, deps).await;
    job.metrics = metrics.to_json();

    let outcome = match outcome {
        Ok(()) => {
            job.succeed(deps).await?;
            Ok(())
        }
        Err(JobError::SubBatch(inner)) => {
            log_failure(job, &migration, &inner);
            job.failure(Some(inner.as_ref()), true, deps).await?;
            Err(*inner)
        }
        Err(error) => {
            log_failure(job, &migration, &error);
            job.failure(Some(&error), false, deps).await?;
            Err(error)
        }
    };

    let migrated_tuple_count = migration.migrated_tuple_count(deps).await?;
    deps.metrics.track(job, &migration, migrated_tuple_count);

    outcome.map_err(anyhow::Error::from)
}

/// Build the job class and let it process the batch
async fn execute(
    job: &BatchedJob,
    migration: &BatchedMigration,
    deps: &EngineDeps,
) -> (Result<(), JobError>, BatchMetrics) {
    let arguments = job_arguments(job, migration, deps);
    let mut instance = match deps.registry.build(&migration.job_class_name, arguments) {
        Ok(instance) => instance,
        Err(e) => return (Err(JobError::Application(e.into())), BatchMetrics::new()),
    };

    let outcome = instance.perform().await;
    (outcome, instance.batch_metrics().clone())
}

fn log_failure(job: &BatchedJob, migration: &BatchedMigration, error: &JobError) {
    tracing::error!(
        batched_job_id = job.id,
        batched_migration_id = migration.id,
        job_class_name = %migration.job_class_name,
        job_arguments = %migration.job_arguments,
        exception_class = error.class_name(),
        exception_message = %error,
        attempts = job.attempts,
        "Batched job failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Cursor;
    use crate::domains::batched_migrations::job_class::BatchedMigrationJob;
    use crate::domains::batched_migrations::models::{JobStatus, NewMigration};
    use crate::domains::batched_migrations::registry::JobClassRegistry;
    use crate::kernel::TestDependencies;
    use async_trait::async_trait;

    enum Behaviour {
        Succeed,
        Timeout,
        SubBatchTimeout,
    }

    struct ScriptedJob {
        behaviour: fn() -> Behaviour,
        metrics: BatchMetrics,
    }

    #[async_trait]
    impl BatchedMigrationJob for ScriptedJob {
        async fn perform(&mut self) -> Result<(), JobError> {
            self.metrics.record_timing("update_all", 0.5);
            match (self.behaviour)() {
                Behaviour::Succeed => Ok(()),
                Behaviour::Timeout => Err(JobError::StatementTimeout("batch".into())),
                Behaviour::SubBatchTimeout => Err(JobError::sub_batch(JobError::StatementTimeout(
                    "sub-batch".into(),
                ))),
            }
        }

        fn batch_metrics(&self) -> &BatchMetrics {
            &self.metrics
        }
    }

    fn registry() -> JobClassRegistry {
        let mut registry = JobClassRegistry::new();
        registry.register("Succeeding", |_| ScriptedJob {
            behaviour: || Behaviour::Succeed,
            metrics: BatchMetrics::new(),
        });
        registry.register("TimingOut", |_| ScriptedJob {
            behaviour: || Behaviour::Timeout,
            metrics: BatchMetrics::new(),
        });
        registry.register("SubBatchTimingOut", |_| ScriptedJob {
            behaviour: || Behaviour::SubBatchTimeout,
            metrics: BatchMetrics::new(),
        });
        registry
    }

    async fn job_for(test: &TestDependencies, job_class_name: &str) -> BatchedJob {
        let deps = test.deps();
        let migration = deps
            .store
            .create_migration(
                NewMigration::builder()
                    .job_class_name(job_class_name)
                    .table_name("events")
                    .column_name("id")
                    .min_cursor(Cursor::single(1))
                    .max_cursor(Cursor::single(20))
                    .batch_size(10_i64)
                    .sub_batch_size(10_i64)
                    .interval_secs(120_i64)
                    .pause_ms(0)
                    .build(),
                deps.now(),
            )
            .await
            .unwrap();

        migration
            .create_batched_job(Cursor::single(1), Cursor::single(10), &deps)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_stores_metrics_and_reports_them() {
        let test = TestDependencies::new().with_registry(registry());
        let deps = test.deps();
        let mut job = job_for(&test, "Succeeding").await;

        perform(&mut job, &deps).await.unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.metrics["timings"]["update_all"][0], 0.5);

        let tracked = test.metrics.tracked();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].migrated_tuple_count, 10);
    }

    #[tokio::test]
    async fn failure_is_recorded_then_returned() {
        let test = TestDependencies::new().with_registry(registry());
        let deps = test.deps();
        let mut job = job_for(&test, "TimingOut").await;

        let err = perform(&mut job, &deps).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::StatementTimeout(_))
        ));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.metrics["timings"]["update_all"][0], 0.5);

        let logs = deps.store.transition_logs_for_job(job.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].exception_class.as_deref(), Some("StatementTimeout"));
        assert_eq!(test.error_tracker.tracked().len(), 1);

        let tracked = test.metrics.tracked();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].job_id, job.id);
        assert_eq!(tracked[0].status, JobStatus::Failed);
        assert_eq!(tracked[0].migrated_tuple_count, 0);
    }

    #[tokio::test]
    async fn sub_batch_failure_shrinks_the_sub_batch() {
        let test = TestDependencies::new().with_registry(registry());
        let deps = test.deps();
        let mut job = job_for(&test, "SubBatchTimingOut").await;

        let err = perform(&mut job, &deps).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::StatementTimeout(_))
        ));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.sub_batch_size, 7);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn unknown_job_class_fails_the_job() {
        let test = TestDependencies::new();
        let deps = test.deps();
        let mut job = job_for(&test, "Missing").await;

        let err = perform(&mut job, &deps).await.unwrap_err();

        assert_eq!(err.to_string(), "unknown job class: Missing");
        assert!(err.downcast_ref::<JobError>().is_some());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn missing_migration_is_not_a_job_failure() {
        let test = TestDependencies::new().with_registry(registry());
        let deps = test.deps();
        let mut job = job_for(&test, "Succeeding").await;
        job.batched_background_migration_id = 9_999;

        let err = perform(&mut job, &deps).await.unwrap_err();

        assert!(err.downcast_ref::<JobError>().is_none());
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotFound { .. })
        ));
        assert_eq!(job.status, JobStatus::Pending);
    }
}
