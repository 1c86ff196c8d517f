//! Batched job model: one contiguous key range of a migration.
//!
//! Lifecycle:
//!
//! ```text
//! pending ──run──► running ──succeed──► succeeded
//!                    │  ▲
//!                 failure│run (retry)
//!                    ▼  │
//!                   failed ──(split / reduce sub-batch, attempts reset)
//! ```
//!
//! Every transition is persisted together with a transition log row. Failures
//! additionally shrink the sub-batch or split the range in two when the
//! failure looks like a timeout that a smaller unit of work would avoid.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::transition_log::NewTransitionLog;
use crate::common::Cursor;
use crate::domains::batched_migrations::error::{EngineError, JobError};
use crate::kernel::EngineDeps;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batched_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Run,
    Succeed,
    Failure,
}

impl JobEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Succeed => "succeed",
            Self::Failure => "failure",
        }
    }
}

/// (event, allowed source statuses, target status)
const JOB_TRANSITIONS: &[(JobEvent, &[JobStatus], JobStatus)] = &[
    (
        JobEvent::Run,
        &[JobStatus::Pending, JobStatus::Running, JobStatus::Failed],
        JobStatus::Running,
    ),
    (JobEvent::Succeed, &[JobStatus::Running], JobStatus::Succeeded),
    (
        JobEvent::Failure,
        &[JobStatus::Pending, JobStatus::Running],
        JobStatus::Failed,
    ),
];

pub fn next_job_status(from: JobStatus, event: JobEvent) -> Option<JobStatus> {
    JOB_TRANSITIONS
        .iter()
        .find(|(e, sources, _)| *e == event && sources.contains(&from))
        .map(|(_, _, to)| *to)
}

// ============================================================================
// Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BatchedJob {
    pub id: i64,
    pub batched_background_migration_id: i64,
    pub min_cursor: Cursor,
    pub max_cursor: Cursor,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub pause_ms: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub metrics: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct NewJob {
    pub batched_background_migration_id: i64,
    pub min_cursor: Cursor,
    pub max_cursor: Cursor,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    #[builder(default = 100)]
    pub pause_ms: i32,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub attempts: i32,
}

impl fmt::Display for BatchedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchedJob[id: {}]", self.id)
    }
}

impl BatchedJob {
    /// Apply `event` in memory, running its hooks. Returns the previous status.
    pub fn apply_transition(
        &mut self,
        event: JobEvent,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, EngineError> {
        let previous = self.status;
        let next = next_job_status(previous, event).ok_or_else(|| EngineError::InvalidTransition {
            record: "batched job",
            from: previous.to_string(),
            event: event.as_str(),
        })?;

        match event {
            JobEvent::Run => {
                self.attempts += 1;
                self.started_at = Some(now);
                self.finished_at = None;
                self.metrics = json!({});
            }
            JobEvent::Succeed | JobEvent::Failure => self.finished_at = Some(now),
        }

        self.status = next;
        self.updated_at = now;
        Ok(previous)
    }

    /// Execution duration relative to the migration interval; succeeded jobs only
    pub fn time_efficiency(&self, interval_secs: i64) -> Option<f64> {
        if self.status != JobStatus::Succeeded || interval_secs <= 0 {
            return None;
        }

        let started_at = self.started_at?;
        let finished_at = self.finished_at?;
        let duration = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
        Some(duration / interval_secs as f64)
    }

    /// Running without any update for longer than `timeout`
    pub fn is_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == JobStatus::Running && self.updated_at <= now - timeout
    }

    pub fn attempts_exhausted(&self, max_attempts: i32) -> bool {
        self.attempts >= max_attempts
    }

    /// Exhausted timeouts on a batch that can still be halved
    pub fn can_split(&self, error: Option<&JobError>, max_attempts: i32) -> bool {
        self.attempts_exhausted(max_attempts)
            && error.is_some_and(JobError::is_timeout)
            && self.batch_size > self.sub_batch_size
            && self.batch_size > 1
    }

    /// Percentage the sub-batch shrank relative to the migration's configured
    /// size exceeds `threshold_percent`
    pub fn sub_batch_exceeds_threshold(
        &self,
        initial_sub_batch_size: i64,
        threshold_percent: Option<f64>,
    ) -> bool {
        let Some(threshold) = threshold_percent else {
            return false;
        };
        if initial_sub_batch_size <= 0 {
            return false;
        }

        let diff = (initial_sub_batch_size - self.sub_batch_size) as f64;
        let percent = (diff / initial_sub_batch_size as f64 * 100.0 * 100.0).round() / 100.0;
        percent > threshold
    }

    /// Sub-batch failures shrink the sub-batch while attempts remain; once
    /// exhausted, splitting takes over
    pub fn can_reduce_sub_batch_size(
        &self,
        max_attempts: i32,
        initial_sub_batch_size: i64,
        threshold_percent: Option<f64>,
    ) -> bool {
        !self.attempts_exhausted(max_attempts)
            && self.sub_batch_size > 1
            && !self.sub_batch_exceeds_threshold(initial_sub_batch_size, threshold_percent)
    }

    /// `floor(sub_batch_size * factor)` clamped to `[1, batch_size]`
    pub fn reduced_sub_batch_size(&self, factor: f64) -> i64 {
        let reduced = (self.sub_batch_size as f64 * factor).floor() as i64;
        reduced.clamp(1, self.batch_size.max(1))
    }

    // ========================================================================
    // Persistence-backed operations
    // ========================================================================

    pub async fn find(id: i64, deps: &EngineDeps) -> Result<Self> {
        deps.store
            .find_job(id)
            .await?
            .ok_or_else(|| EngineError::NotFound { record: "batched job", id }.into())
    }

    /// Mark the job as running (one more attempt)
    pub async fn run(&mut self, deps: &EngineDeps) -> Result<()> {
        self.record_transition(JobEvent::Run, None, deps).await
    }

    pub async fn succeed(&mut self, deps: &EngineDeps) -> Result<()> {
        self.record_transition(JobEvent::Succeed, None, deps).await
    }

    /// Mark the job as failed, then shrink its sub-batch or split it when the
    /// failure allows. Errors from shrinking or splitting are logged, not
    /// returned.
    pub async fn failure(
        &mut self,
        error: Option<&JobError>,
        from_sub_batch: bool,
        deps: &EngineDeps,
    ) -> Result<()> {
        self.record_transition(JobEvent::Failure, error, deps).await?;

        let migration = deps
            .store
            .find_migration(self.batched_background_migration_id)
            .await?
            .ok_or(EngineError::NotFound {
                record: "batched migration",
                id: self.batched_background_migration_id,
            })?;

        let settings = &deps.settings;
        if from_sub_batch
            && self.can_reduce_sub_batch_size(
                settings.max_attempts,
                migration.sub_batch_size,
                settings.sub_batch_size_threshold_percent,
            )
        {
            if let Err(e) = self.reduce_sub_batch_size(deps).await {
                tracing::warn!(batched_job_id = self.id, error = %e, "Failed to reduce sub-batch size");
            }
        }

        if self.can_split(error, settings.max_attempts) {
            if let Err(e) = self.split_and_retry(deps).await {
                tracing::warn!(batched_job_id = self.id, error = %e, "Failed to split batched job");
            }
        }

        Ok(())
    }

    /// Halve the range of a failed job.
    ///
    /// The job keeps the lower half `[min, midpoint]`; a new pending sibling
    /// covers the rest. Attempts restart from zero. When the range holds no
    /// midpoint (a single row, or a batch of one) only the batch size is halved
    /// and the attempts reset, so the job is retried as-is.
    pub async fn split_and_retry(&mut self, deps: &EngineDeps) -> Result<Option<BatchedJob>> {
        if self.status != JobStatus::Failed {
            return Err(EngineError::SplitAndRetry("Only failed jobs can be split".into()).into());
        }

        let now = deps.now();
        let new_batch_size = (self.batch_size / 2).max(1);
        let midpoint = if self.batch_size > 1 {
            self.midpoint(new_batch_size, deps).await?
        } else {
            None
        };

        self.batch_size = new_batch_size;
        self.sub_batch_size = self.sub_batch_size.min(new_batch_size);
        self.attempts = 0;
        self.updated_at = now;

        let sibling_min = midpoint.as_ref().and_then(Cursor::successor);
        let (Some(midpoint), Some(sibling_min)) = (midpoint, sibling_min) else {
            deps.store.update_job(self).await?;
            tracing::info!(
                batched_job_id = self.id,
                batched_migration_id = self.batched_background_migration_id,
                new_batch_size,
                "Batched job has no midpoint, retrying with a smaller batch size"
            );
            return Ok(None);
        };

        let old_max_cursor = std::mem::replace(&mut self.max_cursor, midpoint.clone());
        self.started_at = None;
        self.finished_at = None;
        self.metrics = json!({});

        let sibling = NewJob::builder()
            .batched_background_migration_id(self.batched_background_migration_id)
            .min_cursor(sibling_min)
            .max_cursor(old_max_cursor)
            .batch_size(new_batch_size)
            .sub_batch_size(self.sub_batch_size)
            .pause_ms(self.pause_ms)
            .build();

        let sibling = deps.store.split_job(self, sibling, now).await?;

        tracing::info!(
            batched_job_id = self.id,
            sibling_job_id = sibling.id,
            batched_migration_id = self.batched_background_migration_id,
            min_cursor = %self.min_cursor,
            midpoint = %self.max_cursor,
            max_cursor = %sibling.max_cursor,
            new_batch_size,
            "Batched job split"
        );
        Ok(Some(sibling))
    }

    /// Existing key strictly below `max_cursor` closing a window of at most
    /// `size` rows from `min_cursor`.
    ///
    /// Ranges with fewer rows than `size` shrink the window until it ends
    /// inside the range. `None` when the range holds a single row.
    async fn midpoint(&self, size: i64, deps: &EngineDeps) -> Result<Option<Cursor>> {
        let migration = deps
            .store
            .find_migration(self.batched_background_migration_id)
            .await?
            .ok_or(EngineError::NotFound {
                record: "batched migration",
                id: self.batched_background_migration_id,
            })?;
        let columns = migration.batch_columns();

        let mut size = size;
        while size >= 1 {
            let window = deps
                .connection
                .key_window(
                    &migration.table_name,
                    &columns,
                    &self.min_cursor,
                    Some(&self.max_cursor),
                    size,
                )
                .await?;

            match window {
                Some((_, last)) if last < self.max_cursor => return Ok(Some(last)),
                Some(_) => size /= 2,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Shrink the sub-batch of a failed job and restart its attempts.
    ///
    /// Returns `false` without touching the job when the threshold is exceeded
    /// or the size is already at its floor.
    pub async fn reduce_sub_batch_size(&mut self, deps: &EngineDeps) -> Result<bool> {
        if self.status != JobStatus::Failed {
            return Err(EngineError::ReduceSubBatchSize(
                "Only sub_batch_size of failed jobs can be reduced".into(),
            )
            .into());
        }

        let migration = deps
            .store
            .find_migration(self.batched_background_migration_id)
            .await?
            .ok_or(EngineError::NotFound {
                record: "batched migration",
                id: self.batched_background_migration_id,
            })?;

        if self.sub_batch_exceeds_threshold(
            migration.sub_batch_size,
            deps.settings.sub_batch_size_threshold_percent,
        ) {
            return Ok(false);
        }

        let old_sub_batch_size = self.sub_batch_size;
        let new_sub_batch_size = self.reduced_sub_batch_size(deps.settings.sub_batch_reduce_factor);
        if new_sub_batch_size == old_sub_batch_size {
            return Ok(false);
        }

        self.sub_batch_size = new_sub_batch_size;
        self.attempts = 0;
        self.updated_at = deps.now();
        deps.store.update_job(self).await?;

        tracing::info!(
            batched_job_id = self.id,
            batched_migration_id = self.batched_background_migration_id,
            job_class_name = %migration.job_class_name,
            job_arguments = %migration.job_arguments,
            old_sub_batch_size,
            new_sub_batch_size,
            "Sub batch size reduced"
        );
        Ok(true)
    }

    /// Persist a transition with its log row, structured log line and, for
    /// failures, an error report
    async fn record_transition(
        &mut self,
        event: JobEvent,
        error: Option<&JobError>,
        deps: &EngineDeps,
    ) -> Result<()> {
        let now = deps.now();
        let previous = self.apply_transition(event, now)?;
        deps.store.update_job(self).await?;

        let log = NewTransitionLog {
            batched_background_migration_job_id: self.id,
            previous_status: previous,
            next_status: self.status,
            exception_class: error.map(|e| e.class_name().to_string()),
            exception_message: error.map(|e| e.to_string()),
        };
        deps.store.insert_transition_log(log, now).await?;

        if let Some(error) = error {
            deps.error_tracker.track_exception(
                error,
                json!({
                    "batched_job_id": self.id,
                    "batched_migration_id": self.batched_background_migration_id,
                    "attempts": self.attempts,
                    "exception_class": error.class_name(),
                }),
            );
        }

        tracing::info!(
            batched_job_id = self.id,
            batched_migration_id = self.batched_background_migration_id,
            previous_status = %previous,
            new_status = %self.status,
            attempts = self.attempts,
            exception_class = error.map(JobError::class_name),
            "BatchedJob transition"
        );
        Ok(())
    }
}
