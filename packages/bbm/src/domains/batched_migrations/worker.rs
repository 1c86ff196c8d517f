//! Task worker draining dispatched migration runs.
//!
//! Several workers may share one receiver; each task is handled by exactly
//! one of them. The per-migration lease keeps two workers (in this or other
//! processes) from running the same migration at once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::Scheduler;
use crate::kernel::{MigrationTask, SharedTaskReceiver};

pub struct TaskWorker {
    name: String,
    scheduler: Arc<Scheduler>,
    receiver: SharedTaskReceiver,
}

impl TaskWorker {
    pub fn new(name: impl Into<String>, scheduler: Arc<Scheduler>, receiver: SharedTaskReceiver) -> Self {
        Self {
            name: name.into(),
            scheduler,
            receiver,
        }
    }

    /// Process tasks until `shutdown` fires or the queue closes
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.name, "Task worker started");

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = self.next_task() => task,
            };

            let Some(task) = task else {
                debug!(worker = %self.name, "Task queue closed");
                break;
            };
            self.handle(task).await;
        }

        info!(worker = %self.name, "Task worker stopped");
    }

    async fn next_task(&self) -> Option<MigrationTask> {
        self.receiver.lock().await.recv().await
    }

    async fn handle(&self, task: MigrationTask) {
        match task {
            MigrationTask::RunMigrationJob { migration_id } => {
                match self.scheduler.run_migration(migration_id).await {
                    Ok(outcome) => debug!(
                        worker = %self.name,
                        batched_migration_id = migration_id,
                        outcome = ?outcome,
                        "Task processed"
                    ),
                    Err(e) => warn!(
                        worker = %self.name,
                        batched_migration_id = migration_id,
                        error = %e,
                        "Task failed"
                    ),
                }
            }
        }
    }
}
