//! Integration tests for job failures.
//!
//! Covers:
//! - Splitting batches that keep timing out
//! - Shrinking sub-batches after sub-batch timeouts
//! - Failing the migration on exhausted jobs and on the failure ratio
//! - Retrying stuck jobs and failed jobs

mod common;

use bbm_core::common::Cursor;
use bbm_core::domains::batched_migrations::{
    JobError, JobStatus, MigrationOutcome, MigrationStatus, RunOptions,
};
use bbm_core::EngineSettings;
use chrono::Duration;

use crate::common::TestHarness;

// =============================================================================
// Split
// =============================================================================

#[tokio::test]
async fn batch_timing_out_on_every_attempt_is_split_in_half() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.batch_timeout_above = Some(5));
    let mut migration = h.queue(1..=20, 10, 5).await;
    let runner = h.runner();

    for attempt in 1..=3 {
        let err = runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err.downcast_ref::<JobError>(), Some(JobError::StatementTimeout(_))),
            "attempt {} failed with {}",
            attempt,
            err
        );
    }

    let jobs = h.jobs(&migration).await;
    assert_eq!(TestHarness::ranges(&jobs), vec![(1, 5), (6, 10)]);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[1].status, JobStatus::Pending);
    assert!(jobs.iter().all(|job| job.attempts == 0 && job.batch_size == 5));
    assert_eq!(migration.status, MigrationStatus::Active);

    let logs = h
        .deps()
        .store
        .transition_logs_for_job(jobs[0].id)
        .await
        .unwrap();
    let failures: Vec<_> = logs
        .iter()
        .filter(|log| log.next_status == JobStatus::Failed)
        .collect();
    assert_eq!(failures.len(), 3);
    assert!(failures
        .iter()
        .all(|log| log.exception_class.as_deref() == Some("StatementTimeout")));
}

#[tokio::test]
async fn migration_with_split_jobs_still_covers_every_row() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.batch_timeout_above = Some(5));
    let mut migration = h.queue(1..=20, 10, 5).await;

    let status = h.runner().run_entire_migration(&mut migration).await.unwrap();

    assert_eq!(status, MigrationStatus::Finished);
    let jobs = h.jobs(&migration).await;
    assert_eq!(
        TestHarness::ranges(&jobs),
        vec![(1, 5), (6, 10), (11, 15), (16, 20)]
    );
    assert!(jobs.iter().all(|job| job.status == JobStatus::Succeeded));
    assert!(h.unmigrated_keys().is_empty());
}

#[tokio::test]
async fn partial_last_batch_splits_at_an_existing_key() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.batch_timeout_from = Some(21));
    let mut migration = h.queue(1..=23, 10, 5).await;
    let runner = h.runner();

    for _ in 0..2 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap();
    }
    for _ in 0..3 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
    }

    assert_eq!(migration.status, MigrationStatus::Active);
    let jobs = h.jobs(&migration).await;
    assert_eq!(
        TestHarness::ranges(&jobs),
        vec![(1, 10), (11, 20), (21, 22), (23, 23)]
    );
    assert_eq!(jobs[2].status, JobStatus::Failed);
    assert_eq!(jobs[3].status, JobStatus::Pending);
    assert!(jobs[2..].iter().all(|job| job.attempts == 0 && job.batch_size == 5));

    h.faults.clear();
    let status = runner.run_entire_migration(&mut migration).await.unwrap();
    assert_eq!(status, MigrationStatus::Finished);
    assert!(h.unmigrated_keys().is_empty());
}

#[tokio::test]
async fn single_row_batch_retries_with_a_smaller_batch_size() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.batch_timeout_from = Some(21));
    let mut migration = h.queue(1..=21, 10, 5).await;
    let runner = h.runner();

    for _ in 0..2 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap();
    }
    for _ in 0..3 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
    }

    assert_eq!(migration.status, MigrationStatus::Active);
    let jobs = h.jobs(&migration).await;
    assert_eq!(TestHarness::ranges(&jobs), vec![(1, 10), (11, 20), (21, 21)]);
    assert_eq!(jobs[2].status, JobStatus::Failed);
    assert_eq!(jobs[2].attempts, 0);
    assert_eq!(jobs[2].batch_size, 5);

    h.faults.clear();
    let status = runner.run_entire_migration(&mut migration).await.unwrap();
    assert_eq!(status, MigrationStatus::Finished);
}

// =============================================================================
// Sub-batch size reduction
// =============================================================================

#[tokio::test]
async fn sub_batch_timeouts_shrink_the_sub_batch_until_it_fits() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.sub_batch_timeout_above = Some(2));
    let mut migration = h.queue(1..=20, 20, 10).await;
    let runner = h.runner();

    let mut sizes = Vec::new();
    for _ in 0..4 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
        let jobs = h.jobs(&migration).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, 0);
        sizes.push(jobs[0].sub_batch_size);
    }
    assert_eq!(sizes, vec![7, 5, 3, 2]);

    let outcome = runner
        .run_migration_job(&mut migration, RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        MigrationOutcome::Executed {
            status: JobStatus::Succeeded,
            ..
        }
    ));
    assert!(h.unmigrated_keys().is_empty());
}

#[tokio::test]
async fn sub_batch_size_stops_shrinking_at_one() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.sub_batch_timeout_above = Some(0));
    let mut migration = h.queue(1..=20, 20, 10).await;
    let runner = h.runner();

    let mut sizes = Vec::new();
    for _ in 0..6 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
        sizes.push(h.jobs(&migration).await[0].sub_batch_size);
    }

    assert_eq!(sizes, vec![7, 5, 3, 2, 1, 1]);
    let job = &h.jobs(&migration).await[0];
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn sub_batch_reduction_respects_the_threshold() {
    let settings = EngineSettings::builder()
        .sub_batch_size_threshold_percent(Some(50.0))
        .build();
    let h = TestHarness::with_settings(settings);
    h.faults.update(|plan| plan.sub_batch_timeout_above = Some(0));
    let mut migration = h.queue(1..=20, 20, 10).await;
    let runner = h.runner();

    let mut sizes = Vec::new();
    for _ in 0..4 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
        sizes.push(h.jobs(&migration).await[0].sub_batch_size);
    }

    // Shrinking stops once the sub-batch is 70% below the configured 10
    assert_eq!(sizes, vec![7, 5, 3, 3]);
}

// =============================================================================
// Failing the migration
// =============================================================================

#[tokio::test]
async fn exhausted_job_fails_the_migration_until_retried() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.application_error = true);
    let mut migration = h.queue(1..=10, 10, 10).await;
    let runner = h.runner();

    for _ in 0..3 {
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap_err();
    }

    assert_eq!(migration.status, MigrationStatus::Failed);
    let jobs = h.jobs(&migration).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempts, 3);
    assert_eq!(
        runner
            .run_migration_job(&mut migration, RunOptions::default())
            .await
            .unwrap(),
        MigrationOutcome::NotRunnable
    );

    h.faults.clear();
    let reset = migration.retry_failed_jobs(&h.deps()).await.unwrap();
    assert_eq!(reset, 1);
    assert_eq!(migration.status, MigrationStatus::Active);

    let status = runner.run_entire_migration(&mut migration).await.unwrap();
    assert_eq!(status, MigrationStatus::Finished);
    let jobs = h.jobs(&migration).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Succeeded);
}

#[tokio::test]
async fn application_errors_are_retried_without_splitting() {
    let h = TestHarness::new();
    h.faults.update(|plan| plan.application_error = true);
    let mut migration = h.queue(1..=20, 10, 5).await;

    let status = h.runner().run_entire_migration(&mut migration).await.unwrap();

    assert_eq!(status, MigrationStatus::Failed);
    let jobs = h.jobs(&migration).await;
    assert_eq!(TestHarness::ranges(&jobs), vec![(1, 10)]);
    assert_eq!(h.engine.error_tracker.tracked().len(), 3);
}

#[tokio::test]
async fn high_failure_ratio_stops_the_migration() {
    let settings = EngineSettings::builder().minimum_jobs(4).build();
    let h = TestHarness::with_settings(settings);
    let mut migration = h.queue(1..=100, 10, 10).await;
    let deps = h.deps();

    for (lower, upper) in [(1_i64, 10_i64), (11, 20), (21, 30), (31, 40)] {
        let mut job = migration
            .create_batched_job(Cursor::single(lower), Cursor::single(upper), &deps)
            .await
            .unwrap();
        if lower > 1 {
            job.run(&deps).await.unwrap();
            job.failure(None, false, &deps).await.unwrap();
        }
    }

    h.faults.update(|plan| plan.application_error = true);
    h.runner()
        .run_migration_job(&mut migration, RunOptions::default())
        .await
        .unwrap_err();

    // Every job failed once, none of them exhausted its attempts
    assert_eq!(migration.status, MigrationStatus::Failed);
    assert!(h.jobs(&migration).await.iter().all(|job| job.attempts < 3));
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn stuck_job_is_rerun_instead_of_creating_a_new_one() {
    let h = TestHarness::new();
    let mut migration = h.queue(1..=20, 10, 10).await;
    let deps = h.deps();

    let mut stuck = migration
        .create_batched_job(Cursor::single(1), Cursor::single(10), &deps)
        .await
        .unwrap();
    stuck.run(&deps).await.unwrap();
    h.advance(Duration::hours(2));

    let outcome = h
        .runner()
        .run_migration_job(&mut migration, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MigrationOutcome::Executed {
            job_id: stuck.id,
            status: JobStatus::Succeeded
        }
    );
    let jobs = h.jobs(&migration).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempts, 2);
}

#[tokio::test]
async fn running_job_within_timeout_is_left_alone() {
    let h = TestHarness::new();
    let mut migration = h.queue(1..=20, 10, 10).await;
    let deps = h.deps();

    let mut running = migration
        .create_batched_job(Cursor::single(1), Cursor::single(10), &deps)
        .await
        .unwrap();
    running.run(&deps).await.unwrap();
    h.advance(Duration::minutes(10));

    h.runner()
        .run_migration_job(&mut migration, RunOptions::default())
        .await
        .unwrap();

    let jobs = h.jobs(&migration).await;
    assert_eq!(TestHarness::ranges(&jobs), vec![(1, 10), (11, 20)]);
    assert_eq!(jobs[0].status, JobStatus::Running);
    assert_eq!(jobs[1].status, JobStatus::Succeeded);
}
