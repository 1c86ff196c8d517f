//! Periodic tick over executable migrations.
//!
//! Each tick looks at the active migrations of one schema (at most one per
//! table) and, for every one of them, runs at most one job:
//!
//! ```text
//! perform (tick)
//!     └─► for each executable migration
//!             ├─► take execution lease        (else Locked)
//!             ├─► reload, still executable?   (else NotRunnable)
//!             ├─► interval elapsed?           (else IntervalNotElapsed)
//!             ├─► health signals              (Stop ─► hold, OnHold)
//!             ├─► Runner::run_migration_job   (optimize unless a signal is Unknown)
//!             └─► release lease
//! ```

use anyhow::Result;
use uuid::Uuid;

use super::health_status::{self, SignalKind};
use super::models::BatchedMigration;
use super::runner::{MigrationOutcome, RunOptions, Runner};
use crate::kernel::{EngineDeps, MigrationTask, TaskQueue};

pub struct Scheduler {
    deps: EngineDeps,
    runner: Runner,
    schema_name: String,
    worker_id: String,
}

impl Scheduler {
    pub fn new(deps: EngineDeps, schema_name: impl Into<String>) -> Self {
        Self {
            runner: Runner::new(deps.clone()),
            deps,
            schema_name: schema_name.into(),
            worker_id: format!("bbm-{}", Uuid::new_v4()),
        }
    }

    /// Identify this process as `worker_id` when taking leases
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn executable_migrations(&self) -> Result<Vec<BatchedMigration>> {
        self.deps
            .store
            .executable_migrations(
                &self.schema_name,
                self.deps.now(),
                self.deps.settings.max_migrations_per_tick,
            )
            .await
    }

    /// Run one tick inline. Errors of single migrations are logged and
    /// reported as [`MigrationOutcome::Errored`].
    pub async fn perform(&self) -> Result<Vec<(i64, MigrationOutcome)>> {
        let migrations = self.executable_migrations().await?;
        if migrations.is_empty() {
            tracing::debug!(schema = %self.schema_name, "No executable batched migrations");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(migrations.len());
        for mut migration in migrations {
            let outcome = self.process_logged(&mut migration).await;
            outcomes.push((migration.id, outcome));
        }
        Ok(outcomes)
    }

    /// Enqueue one task per executable migration instead of running them
    pub async fn dispatch(&self, queue: &dyn TaskQueue) -> Result<usize> {
        let migrations = self.executable_migrations().await?;
        for migration in &migrations {
            queue
                .submit(MigrationTask::RunMigrationJob {
                    migration_id: migration.id,
                })
                .await?;
        }

        tracing::debug!(
            schema = %self.schema_name,
            count = migrations.len(),
            "Dispatched batched migrations"
        );
        Ok(migrations.len())
    }

    /// Execute a dispatched task
    pub async fn run_migration(&self, migration_id: i64) -> Result<MigrationOutcome> {
        let Some(mut migration) = self.deps.store.find_migration(migration_id).await? else {
            tracing::warn!(batched_migration_id = migration_id, "Dispatched batched migration not found");
            return Ok(MigrationOutcome::NotRunnable);
        };

        // State may have changed since dispatch
        if !migration.is_executable(self.deps.now()) {
            return Ok(MigrationOutcome::NotRunnable);
        }

        Ok(self.process_logged(&mut migration).await)
    }

    async fn process_logged(&self, migration: &mut BatchedMigration) -> MigrationOutcome {
        match self.process(migration).await {
            Ok(outcome) => {
                tracing::debug!(
                    batched_migration_id = migration.id,
                    outcome = ?outcome,
                    "Batched migration processed"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(
                    batched_migration_id = migration.id,
                    migration_identifier = %migration.migration_identifier(),
                    error = %e,
                    "Batched migration run failed"
                );
                MigrationOutcome::Errored {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Run one migration under its execution lease
    async fn process(&self, migration: &mut BatchedMigration) -> Result<MigrationOutcome> {
        let deps = &self.deps;
        let acquired = deps
            .store
            .try_acquire_lease(migration.id, &self.worker_id, deps.now(), deps.settings.lease_ttl)
            .await?;
        if !acquired {
            return Ok(MigrationOutcome::Locked);
        }

        let outcome = match deps.store.find_migration(migration.id).await {
            Ok(Some(fresh)) if fresh.is_executable(deps.now()) => {
                *migration = fresh;
                self.process_leased(migration).await
            }
            // Paused, finished or removed since the tick started
            Ok(_) => Ok(MigrationOutcome::NotRunnable),
            Err(e) => Err(e),
        };

        if let Err(e) = deps.store.release_lease(migration.id, &self.worker_id).await {
            tracing::warn!(batched_migration_id = migration.id, error = %e, "Failed to release lease");
        }
        outcome
    }

    async fn process_leased(&self, migration: &mut BatchedMigration) -> Result<MigrationOutcome> {
        let deps = &self.deps;
        let now = deps.now();

        let last_job = migration.last_job(deps).await?;
        if !migration.interval_elapsed(last_job.as_ref(), now, deps.settings.interval_variance) {
            return Ok(MigrationOutcome::IntervalNotElapsed);
        }

        let signals = health_status::evaluate(migration, None, deps).await;
        if let Some(stop) = signals.iter().find(|signal| signal.is_stop()) {
            let until = now + deps.settings.hold_duration;
            tracing::info!(
                batched_migration_id = migration.id,
                indicator = %stop.indicator,
                reason = %stop.reason,
                "Database health requires a pause"
            );
            migration.hold(until, deps).await?;
            return Ok(MigrationOutcome::OnHold { until });
        }

        let optimize = !signals.iter().any(|signal| signal.kind == SignalKind::Unknown);
        self.runner
            .run_migration_job(migration, RunOptions { optimize })
            .await
    }
}
