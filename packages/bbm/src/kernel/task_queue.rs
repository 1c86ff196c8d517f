//! Task queue used by the scheduler to hand migration runs to workers.
//!
//! The scheduler tick can either execute migrations inline or enqueue one
//! [`MigrationTask`] per executable migration. Workers (see
//! `domains::batched_migrations::worker`) drain the queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Unit of work submitted to the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationTask {
    /// Execute at most one job of the given migration
    RunMigrationJob { migration_id: i64 },
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: MigrationTask) -> Result<()>;
}

/// Bounded in-process queue backed by a tokio mpsc channel
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: mpsc::Sender<MigrationTask>,
}

/// Receiving half shared by all workers of one process
pub type SharedTaskReceiver = Arc<Mutex<mpsc::Receiver<MigrationTask>>>;

impl ChannelTaskQueue {
    pub fn new(capacity: usize) -> (Self, SharedTaskReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, Arc::new(Mutex::new(receiver)))
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn submit(&self, task: MigrationTask) -> Result<()> {
        self.sender
            .send(task)
            .await
            .context("task queue receiver dropped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_tasks_reach_receiver_in_order() {
        let (queue, receiver) = ChannelTaskQueue::new(4);

        queue
            .submit(MigrationTask::RunMigrationJob { migration_id: 1 })
            .await
            .unwrap();
        queue
            .submit(MigrationTask::RunMigrationJob { migration_id: 2 })
            .await
            .unwrap();

        let mut receiver = receiver.lock().await;
        assert_eq!(
            receiver.recv().await,
            Some(MigrationTask::RunMigrationJob { migration_id: 1 })
        );
        assert_eq!(
            receiver.recv().await,
            Some(MigrationTask::RunMigrationJob { migration_id: 2 })
        );
    }

    #[tokio::test]
    async fn submit_fails_once_receiver_is_gone() {
        let (queue, receiver) = ChannelTaskQueue::new(1);
        drop(receiver);

        let result = queue
            .submit(MigrationTask::RunMigrationJob { migration_id: 1 })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn task_serializes_with_type_tag() {
        let json = serde_json::to_value(MigrationTask::RunMigrationJob { migration_id: 7 }).unwrap();
        assert_eq!(json["type"], "run_migration_job");
        assert_eq!(json["migration_id"], 7);
    }
}
