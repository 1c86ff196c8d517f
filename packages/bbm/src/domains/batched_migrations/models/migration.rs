//! Batched migration model and its state machine.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::job::{BatchedJob, NewJob};
use crate::common::Cursor;
use crate::domains::batched_migrations::error::EngineError;
use crate::domains::batched_migrations::optimizer::exponential_moving_average;
use crate::kernel::EngineDeps;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batched_migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    Paused,
    Active,
    Finished,
    Failed,
    Finalizing,
    Finalized,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
        }
    }

    /// No event leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized)
    }

    /// Statuses in which the scheduler may create and run jobs
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Active | Self::Finalizing)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paused" => Ok(Self::Paused),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "finalizing" => Ok(Self::Finalizing),
            "finalized" => Ok(Self::Finalized),
            other => anyhow::bail!("unknown migration status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationEvent {
    Pause,
    Execute,
    Finish,
    Failure,
    Finalize,
    ConfirmFinalize,
}

impl MigrationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Execute => "execute",
            Self::Finish => "finish",
            Self::Failure => "failure",
            Self::Finalize => "finalize",
            Self::ConfirmFinalize => "confirm_finalize",
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

use MigrationEvent as E;
use MigrationStatus as S;

const NON_TERMINAL: &[MigrationStatus] = &[S::Paused, S::Active, S::Finished, S::Failed, S::Finalizing];

/// (event, allowed source statuses, target status)
const MIGRATION_TRANSITIONS: &[(MigrationEvent, &[MigrationStatus], MigrationStatus)] = &[
    (E::Pause, &[S::Active, S::Paused], S::Paused),
    (E::Execute, &[S::Active, S::Paused, S::Failed], S::Active),
    (E::Finish, NON_TERMINAL, S::Finished),
    (E::Failure, NON_TERMINAL, S::Failed),
    (E::Finalize, NON_TERMINAL, S::Finalizing),
    (E::ConfirmFinalize, &[S::Finished, S::Finalized], S::Finalized),
];

/// Target status of `event` fired in `from`, `None` when the event is not allowed
pub fn next_migration_status(from: MigrationStatus, event: MigrationEvent) -> Option<MigrationStatus> {
    MIGRATION_TRANSITIONS
        .iter()
        .find(|(e, sources, _)| *e == event && sources.contains(&from))
        .map(|(_, _, to)| *to)
}

// ============================================================================
// Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BatchedMigration {
    pub id: i64,
    pub job_class_name: String,
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    /// Composite batching key; empty for single-column keys
    pub cursor_columns: Vec<String>,
    pub job_arguments: Value,
    pub schema_name: String,
    pub min_cursor: Cursor,
    pub max_cursor: Cursor,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub interval_secs: i64,
    pub pause_ms: i32,
    pub status: MigrationStatus,
    pub total_tuple_count: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub on_hold_until: Option<DateTime<Utc>>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields that identify one logical migration; at most one unfinished
/// migration may exist per identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationIdentity {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
}

impl MigrationIdentity {
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Value,
    ) -> Self {
        Self {
            job_class_name: job_class_name.into(),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }
}

impl fmt::Display for MigrationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}.{} {}",
            self.job_class_name, self.table_name, self.column_name, self.job_arguments
        )
    }
}

/// Fully resolved values for inserting a migration row
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewMigration {
    pub job_class_name: String,
    #[builder(default = "PrimaryKeyBatchingStrategy".to_string())]
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    #[builder(default)]
    pub cursor_columns: Vec<String>,
    #[builder(default = Value::Array(Vec::new()))]
    pub job_arguments: Value,
    #[builder(default = "main".to_string())]
    pub schema_name: String,
    pub min_cursor: Cursor,
    pub max_cursor: Cursor,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    #[builder(default)]
    pub max_batch_size: Option<i64>,
    pub interval_secs: i64,
    #[builder(default = 100)]
    pub pause_ms: i32,
    #[builder(default = MigrationStatus::Active)]
    pub status: MigrationStatus,
    #[builder(default)]
    pub total_tuple_count: Option<i64>,
}

impl NewMigration {
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity::new(
            self.job_class_name.clone(),
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }
}

impl fmt::Display for BatchedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchedMigration[id: {}]", self.id)
    }
}

impl BatchedMigration {
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity::new(
            self.job_class_name.clone(),
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }

    /// Columns forming the batching key
    pub fn batch_columns(&self) -> Vec<String> {
        if self.cursor_columns.is_empty() {
            vec![self.column_name.clone()]
        } else {
            self.cursor_columns.clone()
        }
    }

    pub fn is_cursor_based(&self) -> bool {
        !self.cursor_columns.is_empty()
    }

    /// `JobClass/table.column`, the identifier exported with metrics
    pub fn migration_identifier(&self) -> String {
        format!("{}/{}.{}", self.job_class_name, self.table_name, self.column_name)
    }

    /// Label set attached to every exported metric
    pub fn prometheus_labels(&self) -> [(&'static str, String); 2] {
        [
            ("migration_id", self.id.to_string()),
            ("migration_identifier", self.migration_identifier()),
        ]
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs)
    }

    pub fn is_on_hold(&self, now: DateTime<Utc>) -> bool {
        self.on_hold_until.is_some_and(|until| until > now)
    }

    /// Active (or finalizing) and not on hold
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_executable() && !self.is_on_hold(now)
    }

    /// Whether enough time passed since the last job was created
    pub fn interval_elapsed(
        &self,
        last_job: Option<&BatchedJob>,
        now: DateTime<Utc>,
        variance: Duration,
    ) -> bool {
        match last_job {
            None => true,
            Some(job) => job.created_at <= now - (self.interval() - variance),
        }
    }

    /// Lower bound of the next batch: one past the highest covered key.
    /// `None` when the last job already ends at the largest possible key.
    pub fn next_min_cursor(&self, last_job: Option<&BatchedJob>) -> Option<Cursor> {
        match last_job {
            Some(job) => job.max_cursor.successor(),
            None => Some(self.min_cursor.clone()),
        }
    }

    /// Percentage of `total_tuple_count` already migrated
    pub fn progress(&self, migrated_tuple_count: i64) -> Option<f64> {
        if matches!(self.status, MigrationStatus::Finished | MigrationStatus::Finalized) {
            return Some(100.0);
        }

        let total = self.total_tuple_count.filter(|total| *total > 0)?;
        let percent = 100.0 * migrated_tuple_count as f64 / total as f64;
        Some(percent.min(100.0))
    }

    /// Remaining jobs times the interval, once anything has been migrated
    pub fn estimated_time_remaining(&self, migrated_tuple_count: i64) -> Option<Duration> {
        self.started_at?;
        let total = self.total_tuple_count.filter(|total| *total > 0)?;
        if migrated_tuple_count <= 0 || self.batch_size <= 0 {
            return None;
        }

        let remaining = (total - migrated_tuple_count).max(0);
        let remaining_jobs = (remaining as f64 / self.batch_size as f64).ceil() as i32;
        Some(self.interval() * remaining_jobs)
    }

    /// Apply `event` in memory, running its hooks. Returns the previous status.
    pub fn apply_transition(
        &mut self,
        event: MigrationEvent,
        now: DateTime<Utc>,
    ) -> Result<MigrationStatus, EngineError> {
        let previous = self.status;
        let next = next_migration_status(previous, event).ok_or_else(|| {
            EngineError::InvalidTransition {
                record: "batched migration",
                from: previous.to_string(),
                event: event.as_str(),
            }
        })?;

        match next {
            MigrationStatus::Active => self.started_at = Some(now),
            MigrationStatus::Finished => self.finished_at = Some(now),
            _ => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(previous)
    }

    // ========================================================================
    // Persistence-backed operations
    // ========================================================================

    /// Fire `event` and persist the result
    pub async fn transition(&mut self, event: MigrationEvent, deps: &EngineDeps) -> Result<()> {
        let previous = self.apply_transition(event, deps.now())?;
        deps.store.update_migration(self).await?;

        tracing::info!(
            batched_migration_id = self.id,
            migration_identifier = %self.migration_identifier(),
            previous_status = %previous,
            new_status = %self.status,
            event = event.as_str(),
            "BatchedMigration transition"
        );

        if self.status == MigrationStatus::Failed {
            let failed_jobs = deps.store.count_failed_jobs(self.id).await?;
            tracing::error!(
                batched_migration_id = self.id,
                migration_identifier = %self.migration_identifier(),
                job_arguments = %self.job_arguments,
                failed_jobs,
                "Batched background migration failed"
            );
        }
        Ok(())
    }

    pub async fn pause(&mut self, deps: &EngineDeps) -> Result<()> {
        self.transition(MigrationEvent::Pause, deps).await
    }

    pub async fn resume(&mut self, deps: &EngineDeps) -> Result<()> {
        self.transition(MigrationEvent::Execute, deps).await
    }

    /// `finished -> finalized`
    pub async fn confirm_finalize(&mut self, deps: &EngineDeps) -> Result<()> {
        self.transition(MigrationEvent::ConfirmFinalize, deps).await
    }

    /// Suspend scheduling until `until`
    pub async fn hold(&mut self, until: DateTime<Utc>, deps: &EngineDeps) -> Result<()> {
        let now = deps.now();
        deps.store.update_on_hold_until(self.id, until, now).await?;
        self.on_hold_until = Some(until);
        self.updated_at = now;

        tracing::info!(
            batched_migration_id = self.id,
            migration_identifier = %self.migration_identifier(),
            on_hold_until = %until,
            "Batched migration put on hold"
        );
        Ok(())
    }

    /// Job covering the highest keys so far
    pub async fn last_job(&self, deps: &EngineDeps) -> Result<Option<BatchedJob>> {
        deps.store.last_job(self.id).await
    }

    pub async fn create_batched_job(
        &self,
        min_cursor: Cursor,
        max_cursor: Cursor,
        deps: &EngineDeps,
    ) -> Result<BatchedJob> {
        let job = NewJob::builder()
            .batched_background_migration_id(self.id)
            .min_cursor(min_cursor)
            .max_cursor(max_cursor)
            .batch_size(self.batch_size)
            .sub_batch_size(self.sub_batch_size.min(self.batch_size))
            .pause_ms(self.pause_ms)
            .build();

        deps.store.create_job(job, deps.now()).await
    }

    pub async fn migrated_tuple_count(&self, deps: &EngineDeps) -> Result<i64> {
        deps.store.migrated_tuple_count(self.id).await
    }

    /// Failure-ratio circuit breaker over jobs created since the last start
    pub async fn should_stop(&self, deps: &EngineDeps) -> Result<bool> {
        let Some(started_at) = self.started_at else {
            return Ok(false);
        };

        let counts = deps.store.job_counts_since(self.id, started_at).await?;
        if counts.total < deps.settings.minimum_jobs || counts.total == 0 {
            return Ok(false);
        }

        Ok(counts.failed as f64 / counts.total as f64 > deps.settings.maximum_failed_ratio)
    }

    /// Exponential moving average of the time efficiency of the most recent
    /// successful jobs, `None` while fewer than `number_of_jobs` succeeded
    pub async fn smoothed_time_efficiency(
        &self,
        number_of_jobs: i64,
        alpha: f64,
        deps: &EngineDeps,
    ) -> Result<Option<f64>> {
        let jobs = deps
            .store
            .successful_jobs_newest_first(self.id, number_of_jobs)
            .await?;
        if (jobs.len() as i64) < number_of_jobs {
            return Ok(None);
        }

        let efficiencies: Vec<f64> = jobs
            .iter()
            .filter_map(|job| job.time_efficiency(self.interval_secs))
            .collect();

        Ok(exponential_moving_average(&efficiencies, alpha))
    }

    /// Reset the attempts of failed jobs and resume execution
    pub async fn retry_failed_jobs(&mut self, deps: &EngineDeps) -> Result<u64> {
        let reset = deps
            .store
            .reset_failed_job_attempts(self.id, deps.now())
            .await?;
        self.transition(MigrationEvent::Execute, deps).await?;
        Ok(reset)
    }
}
