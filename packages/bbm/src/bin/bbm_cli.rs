//! Operator CLI for batched background migrations
//!
//! Every command prints one JSON document on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use bbm_core::common::Cursor;
use bbm_core::domains::batched_migrations::health_status::indicators::default_indicators;
use bbm_core::domains::batched_migrations::jobs::register_bundled_jobs;
use bbm_core::domains::batched_migrations::{
    queue_batched_background_migration, BatchedMigration, JobClassRegistry, JobCounts,
    MigrationIdentity, MigrationOutcome, MigrationStatus, QueueMigration, Runner, Scheduler,
};
use bbm_core::kernel::{EngineDeps, NoopMetricsSink};
use bbm_core::Config;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "bbm")]
#[command(about = "Inspect and operate batched background migrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List migrations, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<MigrationStatus>,
    },

    /// Show status and progress of a migration
    Status { id: i64 },

    /// Queue a new migration
    Queue {
        #[arg(long)]
        job_class: String,
        #[arg(long)]
        table: String,
        #[arg(long, default_value = "id")]
        column: String,
        /// JSON array of job arguments
        #[arg(long, default_value = "[]")]
        job_arguments: String,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        sub_batch_size: Option<i64>,
        #[arg(long)]
        interval_secs: Option<i64>,
        #[arg(long)]
        max_value: Option<i64>,
    },

    /// Pause an active migration
    Pause { id: i64 },

    /// Resume a paused or failed migration
    Resume { id: i64 },

    /// Reset attempts of failed jobs and resume
    Retry { id: i64 },

    /// Run a migration to completion now
    Finalize {
        #[arg(long)]
        job_class: String,
        #[arg(long)]
        table: String,
        #[arg(long, default_value = "id")]
        column: String,
        #[arg(long, default_value = "[]")]
        job_arguments: String,
    },

    /// Mark a finished migration as finalized
    ConfirmFinalize { id: i64 },

    /// Run jobs of an active migration until it stops being active
    Run { id: i64 },

    /// Run one scheduler tick inline
    Tick,
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations: Option<Vec<MigrationSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migration: Option<MigrationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcomes: Option<Vec<TickOutcome>>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            migrations: None,
            migration: None,
            outcomes: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_migration(mut self, migration: MigrationSummary) -> Self {
        self.migration = Some(migration);
        self
    }
}

#[derive(Serialize)]
struct MigrationSummary {
    id: i64,
    identifier: String,
    status: MigrationStatus,
    batch_size: i64,
    sub_batch_size: i64,
    min_cursor: Cursor,
    max_cursor: Cursor,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrated_tuple_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_seconds_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<JobCounts>,
}

impl MigrationSummary {
    fn from_migration(migration: &BatchedMigration) -> Self {
        Self {
            id: migration.id,
            identifier: migration.migration_identifier(),
            status: migration.status,
            batch_size: migration.batch_size,
            sub_batch_size: migration.sub_batch_size,
            min_cursor: migration.min_cursor.clone(),
            max_cursor: migration.max_cursor.clone(),
            progress: None,
            migrated_tuple_count: None,
            estimated_seconds_remaining: None,
            jobs: None,
        }
    }

    async fn detailed(migration: &BatchedMigration, deps: &EngineDeps) -> Result<Self> {
        let migrated = migration.migrated_tuple_count(deps).await?;
        let jobs = deps
            .store
            .job_counts_since(migration.id, migration.created_at)
            .await?;

        Ok(Self {
            progress: migration.progress(migrated),
            migrated_tuple_count: Some(migrated),
            estimated_seconds_remaining: migration
                .estimated_time_remaining(migrated)
                .map(|remaining| remaining.num_seconds()),
            jobs: Some(jobs),
            ..Self::from_migration(migration)
        })
    }
}

#[derive(Serialize)]
struct TickOutcome {
    migration_id: i64,
    #[serde(flatten)]
    outcome: MigrationOutcome,
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let deps = engine_deps(&config).await?;

    match cli.command {
        Commands::List { status } => cmd_list(status, &deps).await,
        Commands::Status { id } => cmd_status(id, &deps).await,
        Commands::Queue {
            job_class,
            table,
            column,
            job_arguments,
            batch_size,
            sub_batch_size,
            interval_secs,
            max_value,
        } => {
            let mut request = QueueMigration::builder()
                .job_class_name(job_class)
                .table_name(table)
                .column_name(column)
                .job_arguments(parse_arguments(&job_arguments)?)
                .schema_name(config.schema_name.clone())
                .batch_max_value(max_value.map(Cursor::single))
                .build();
            if let Some(batch_size) = batch_size {
                request.batch_size = batch_size;
            }
            if let Some(sub_batch_size) = sub_batch_size {
                request.sub_batch_size = sub_batch_size;
            }
            if let Some(interval_secs) = interval_secs {
                request.interval_secs = interval_secs;
            }
            cmd_queue(request, &deps).await
        }
        Commands::Pause { id } => cmd_pause(id, &deps).await,
        Commands::Resume { id } => cmd_resume(id, &deps).await,
        Commands::Retry { id } => cmd_retry(id, &deps).await,
        Commands::Finalize {
            job_class,
            table,
            column,
            job_arguments,
        } => {
            let identity =
                MigrationIdentity::new(job_class, table, column, parse_arguments(&job_arguments)?);
            cmd_finalize(identity, &deps).await
        }
        Commands::ConfirmFinalize { id } => cmd_confirm_finalize(id, &deps).await,
        Commands::Run { id } => cmd_run(id, &deps).await,
        Commands::Tick => cmd_tick(&config, deps).await,
    }
}

async fn engine_deps(config: &Config) -> Result<EngineDeps> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let mut registry = JobClassRegistry::new();
    register_bundled_jobs(&mut registry);

    Ok(EngineDeps::postgres(
        pool.clone(),
        Arc::new(registry),
        Arc::new(NoopMetricsSink),
        default_indicators(pool, &config.indicators),
        config.settings.clone(),
    ))
}

fn parse_arguments(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("job arguments must be valid JSON")
}

async fn find(id: i64, deps: &EngineDeps) -> Result<Option<BatchedMigration>> {
    let migration = deps.store.find_migration(id).await?;
    if migration.is_none() {
        output(Response::failed(format!("Batched migration {} not found", id)))?;
    }
    Ok(migration)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_list(status: Option<MigrationStatus>, deps: &EngineDeps) -> Result<()> {
    let migrations = match status {
        Some(status) => deps.store.migrations_with_status(status).await?,
        None => deps.store.list_migrations().await?,
    };

    output(Response {
        migrations: Some(migrations.iter().map(MigrationSummary::from_migration).collect()),
        ..Response::ok()
    })
}

async fn cmd_status(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(migration) = find(id, deps).await? else {
        return Ok(());
    };

    output(Response::ok().with_migration(MigrationSummary::detailed(&migration, deps).await?))
}

async fn cmd_queue(request: QueueMigration, deps: &EngineDeps) -> Result<()> {
    match queue_batched_background_migration(request, deps).await {
        Ok(migration) => output(
            Response::ok()
                .with_message("Batched migration queued")
                .with_migration(MigrationSummary::from_migration(&migration)),
        ),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_pause(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(mut migration) = find(id, deps).await? else {
        return Ok(());
    };

    match migration.pause(deps).await {
        Ok(()) => output(Response::ok().with_migration(MigrationSummary::from_migration(&migration))),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_resume(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(mut migration) = find(id, deps).await? else {
        return Ok(());
    };

    match migration.resume(deps).await {
        Ok(()) => output(Response::ok().with_migration(MigrationSummary::from_migration(&migration))),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_retry(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(mut migration) = find(id, deps).await? else {
        return Ok(());
    };

    match migration.retry_failed_jobs(deps).await {
        Ok(reset) => output(
            Response::ok()
                .with_message(format!("Reset {} failed jobs", reset))
                .with_migration(MigrationSummary::from_migration(&migration)),
        ),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_finalize(identity: MigrationIdentity, deps: &EngineDeps) -> Result<()> {
    let runner = Runner::new(deps.clone());

    match runner.finalize(&identity).await {
        Ok(Some(migration)) => output(
            Response::ok().with_migration(MigrationSummary::detailed(&migration, deps).await?),
        ),
        Ok(None) => output(Response::failed(format!("No batched migration for {}", identity))),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_confirm_finalize(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(mut migration) = find(id, deps).await? else {
        return Ok(());
    };

    match migration.confirm_finalize(deps).await {
        Ok(()) => output(Response::ok().with_migration(MigrationSummary::from_migration(&migration))),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

async fn cmd_run(id: i64, deps: &EngineDeps) -> Result<()> {
    let Some(mut migration) = find(id, deps).await? else {
        return Ok(());
    };

    let status = Runner::new(deps.clone()).run_entire_migration(&mut migration).await?;
    output(
        Response::ok()
            .with_message(format!("Migration is {}", status))
            .with_migration(MigrationSummary::detailed(&migration, deps).await?),
    )
}

async fn cmd_tick(config: &Config, deps: EngineDeps) -> Result<()> {
    let scheduler = Scheduler::new(deps, config.schema_name.clone());
    let outcomes = scheduler.perform().await?;

    output(Response {
        outcomes: Some(
            outcomes
                .into_iter()
                .map(|(migration_id, outcome)| TickOutcome {
                    migration_id,
                    outcome,
                })
                .collect(),
        ),
        ..Response::ok()
    })
}
