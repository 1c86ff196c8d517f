//! Test fixtures: a job class over the in-memory database with injectable
//! failures, and a health indicator that can be flipped at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bbm_core::domains::batched_migrations::health_status::HealthContext;
use bbm_core::domains::batched_migrations::{
    BatchMetrics, BatchedMigrationJob, HealthIndicator, JobArguments, JobClassRegistry, JobError,
    MigrationStatus, MigrationStore, Signal,
};
use bbm_core::kernel::{InMemoryDatabase, MockClock};
use chrono::Duration;
use serde_json::json;

/// Job class marking every row of its batch with `"migrated": true`
pub const MARK_MIGRATED: &str = "MarkMigrated";

const OPERATION: &str = "update_all";

/// Failures the next job executions run into
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Statement timeout for batches spanning more keys than this
    pub batch_timeout_above: Option<i64>,
    /// Statement timeout for batches starting at or after this key
    pub batch_timeout_from: Option<i64>,
    /// Sub-batch statement timeout while the sub-batch size is above this
    pub sub_batch_timeout_above: Option<i64>,
    /// Non-timeout error on every execution
    pub application_error: bool,
    /// Seconds the mock clock advances while a job runs
    pub duration_secs: i64,
    /// Migration an operator pauses while a job runs
    pub pause_migration: Option<i64>,
}

#[derive(Default)]
pub struct Faults {
    plan: Mutex<FaultPlan>,
}

impl Faults {
    pub fn update(&self, change: impl FnOnce(&mut FaultPlan)) {
        change(&mut self.plan.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn clear(&self) {
        self.update(|plan| *plan = FaultPlan::default());
    }

    pub fn plan(&self) -> FaultPlan {
        self.plan.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct MarkMigratedJob {
    args: JobArguments,
    database: Arc<InMemoryDatabase>,
    store: Arc<dyn MigrationStore>,
    clock: Arc<MockClock>,
    faults: Arc<Faults>,
    metrics: BatchMetrics,
}

#[async_trait]
impl BatchedMigrationJob for MarkMigratedJob {
    async fn perform(&mut self) -> Result<(), JobError> {
        let plan = self.faults.plan();
        self.clock.advance(Duration::seconds(plan.duration_secs));

        if let Some(id) = plan.pause_migration {
            if let Some(mut other) = self.store.find_migration(id).await? {
                other.status = MigrationStatus::Paused;
                self.store.update_migration(&other).await?;
            }
        }

        if plan.application_error {
            return Err(JobError::Application(anyhow!("violates check constraint")));
        }

        let start = self.args.start_cursor.first_value();
        let span = self.args.end_cursor.first_value() - start + 1;
        if plan.batch_timeout_above.is_some_and(|limit| span > limit)
            || plan.batch_timeout_from.is_some_and(|from| start >= from)
        {
            return Err(JobError::StatementTimeout(format!(
                "batch {}..{}",
                self.args.start_cursor, self.args.end_cursor
            )));
        }

        let mut from = self.args.start_cursor.clone();
        while let Some((lower, upper)) = self.args.next_sub_batch(&from).await? {
            if plan
                .sub_batch_timeout_above
                .is_some_and(|limit| self.args.sub_batch_size > limit)
            {
                return Err(JobError::sub_batch(JobError::StatementTimeout(format!(
                    "sub-batch {}..{}",
                    lower, upper
                ))));
            }

            let touched = self
                .database
                .update_range(&self.args.batch_table, &lower, &upper, |row| {
                    if let Some(row) = row.as_object_mut() {
                        row.insert("migrated".into(), json!(true));
                    }
                });
            self.metrics.record_timing(OPERATION, 0.01);
            self.metrics.add_affected_rows(OPERATION, touched);
            let Some(next) = upper.successor() else { break };
            from = next;
        }
        Ok(())
    }

    fn batch_metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

/// Registry with [`MARK_MIGRATED`] bound to the given doubles
pub fn registry(
    database: Arc<InMemoryDatabase>,
    store: Arc<dyn MigrationStore>,
    clock: Arc<MockClock>,
    faults: Arc<Faults>,
) -> JobClassRegistry {
    let mut registry = JobClassRegistry::new();
    registry.register(MARK_MIGRATED, move |args| MarkMigratedJob {
        args,
        database: database.clone(),
        store: store.clone(),
        clock: clock.clone(),
        faults: faults.clone(),
        metrics: BatchMetrics::new(),
    });
    registry
}

/// Indicator voting stop until switched back to normal
pub struct SwitchableIndicator {
    stop: AtomicBool,
}

impl SwitchableIndicator {
    pub const NAME: &'static str = "Switchable";

    pub fn stopping() -> Self {
        Self {
            stop: AtomicBool::new(true),
        }
    }

    pub fn set_stop(&self, stop: bool) {
        self.stop.store(stop, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthIndicator for SwitchableIndicator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate(&self, context: &HealthContext) -> anyhow::Result<Signal> {
        if self.stop.load(Ordering::SeqCst) {
            Ok(Signal::stop(
                Self::NAME,
                format!("autovacuum running on: table {}", context.tables.join(", ")),
            ))
        } else {
            Ok(Signal::normal(Self::NAME, "test signal"))
        }
    }
}

/// Indicator voting stop for one table only
pub struct TableIndicator {
    table: String,
}

impl TableIndicator {
    pub const NAME: &'static str = "Table";

    pub fn stopping_for(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }
}

#[async_trait]
impl HealthIndicator for TableIndicator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate(&self, context: &HealthContext) -> anyhow::Result<Signal> {
        if context.tables.contains(&self.table) {
            Ok(Signal::stop(Self::NAME, format!("autovacuum running on: table {}", self.table)))
        } else {
            Ok(Signal::normal(Self::NAME, "test signal"))
        }
    }
}
