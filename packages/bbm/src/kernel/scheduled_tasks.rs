//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! The tick either runs migrations inline or, when a task queue is given,
//! dispatches them to task workers:
//!
//! ```text
//! JobScheduler (tick_cron)
//!     ├─► Scheduler::perform()            (inline)
//!     └─► Scheduler::dispatch(queue)      (queued)
//!             └─► TaskWorker ─► Scheduler::run_migration(id)
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::batched_migrations::scheduler::Scheduler;
use crate::kernel::TaskQueue;

/// Start the periodic tick
pub async fn start_scheduler(
    tick_cron: &str,
    scheduler: Arc<Scheduler>,
    queue: Option<Arc<dyn TaskQueue>>,
) -> Result<JobScheduler> {
    let cron = JobScheduler::new().await?;

    let tick = Job::new_async(tick_cron, move |_uuid, _lock| {
        let scheduler = scheduler.clone();
        let queue = queue.clone();
        Box::pin(async move {
            if let Err(e) = run_tick(&scheduler, queue.as_deref()).await {
                tracing::error!("Batched migration tick failed: {}", e);
            }
        })
    })?;

    cron.add(tick).await?;
    cron.start().await?;

    tracing::info!(cron = tick_cron, "Batched migration scheduler started");
    Ok(cron)
}

async fn run_tick(scheduler: &Scheduler, queue: Option<&dyn TaskQueue>) -> Result<()> {
    match queue {
        Some(queue) => {
            scheduler.dispatch(queue).await?;
        }
        None => {
            let outcomes = scheduler.perform().await?;
            tracing::debug!(migrations = outcomes.len(), "Batched migration tick finished");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Cursor;
    use crate::domains::batched_migrations::models::NewMigration;
    use crate::kernel::{MigrationTask, RecordingTaskQueue, TestDependencies};

    #[tokio::test]
    async fn queued_tick_dispatches_executable_migrations() {
        let test = TestDependencies::new();
        let deps = test.deps();
        let migration = deps
            .store
            .create_migration(
                NewMigration::builder()
                    .job_class_name("CopyColumn")
                    .table_name("events")
                    .column_name("id")
                    .min_cursor(Cursor::single(1))
                    .max_cursor(Cursor::single(10))
                    .batch_size(5_i64)
                    .sub_batch_size(5_i64)
                    .interval_secs(120_i64)
                    .build(),
                deps.now(),
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(deps, "main");
        let queue = RecordingTaskQueue::new();
        run_tick(&scheduler, Some(&queue)).await.unwrap();

        assert_eq!(
            queue.submitted(),
            vec![MigrationTask::RunMigrationJob {
                migration_id: migration.id
            }]
        );
    }
}
