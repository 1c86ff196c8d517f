//! Audit trail of batched job status changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::job::JobStatus;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobTransitionLog {
    pub id: i64,
    pub batched_background_migration_job_id: i64,
    pub previous_status: JobStatus,
    pub next_status: JobStatus,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransitionLog {
    pub batched_background_migration_job_id: i64,
    pub previous_status: JobStatus,
    pub next_status: JobStatus,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
}
