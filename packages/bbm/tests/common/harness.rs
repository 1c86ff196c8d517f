//! Test harnesses.
//!
//! [`TestHarness`] wires the engine to in-memory doubles and a mock clock, so
//! whole migrations run in a few milliseconds. [`PostgresHarness`] runs against
//! a real Postgres started once per test binary with testcontainers.

use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};
use bbm_core::common::Cursor;
use bbm_core::domains::batched_migrations::{
    queue_batched_background_migration, BatchedJob, BatchedMigration, HealthIndicator,
    QueueMigration, Runner, Scheduler,
};
use bbm_core::kernel::{EngineDeps, TestDependencies};
use bbm_core::EngineSettings;
use chrono::Duration;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use super::fixtures::{self, Faults, MARK_MIGRATED};

pub const TABLE: &str = "events";
pub const SCHEMA: &str = "main";

fn init_tracing() {
    // Run tests with: RUST_LOG=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// In-memory harness
// =============================================================================

pub struct TestHarness {
    pub engine: TestDependencies,
    pub faults: Arc<Faults>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        init_tracing();

        let engine = TestDependencies::new().with_settings(settings);
        let faults = Arc::new(Faults::default());
        let registry = fixtures::registry(
            engine.database.clone(),
            engine.store.clone(),
            engine.clock.clone(),
            faults.clone(),
        );

        Self {
            engine: engine.with_registry(registry),
            faults,
        }
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn HealthIndicator>) -> Self {
        self.engine = self.engine.with_indicator(indicator);
        self
    }

    pub fn deps(&self) -> EngineDeps {
        self.engine.deps()
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.deps())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.deps(), SCHEMA).with_worker_id("test-worker")
    }

    pub fn advance(&self, by: Duration) {
        self.engine.clock.advance(by);
    }

    /// [`MARK_MIGRATED`] over [`TABLE`] without throttling
    pub fn request(batch_size: i64, sub_batch_size: i64) -> QueueMigration {
        QueueMigration::builder()
            .job_class_name(MARK_MIGRATED)
            .table_name(TABLE)
            .column_name("id")
            .batch_size(batch_size)
            .sub_batch_size(sub_batch_size)
            .pause_ms(0)
            .build()
    }

    /// Insert `rows` into [`TABLE`] and queue a migration over them
    pub async fn queue(&self, rows: RangeInclusive<i64>, batch_size: i64, sub_batch_size: i64) -> BatchedMigration {
        self.engine.database.insert_range(TABLE, rows);
        self.queue_request(Self::request(batch_size, sub_batch_size)).await
    }

    pub async fn queue_request(&self, request: QueueMigration) -> BatchedMigration {
        queue_batched_background_migration(request, &self.deps())
            .await
            .expect("Failed to queue migration")
    }

    pub async fn reload(&self, migration: &BatchedMigration) -> BatchedMigration {
        self.deps()
            .store
            .find_migration(migration.id)
            .await
            .expect("Failed to load migration")
            .expect("Migration disappeared")
    }

    /// Jobs of `migration` ordered by range
    pub async fn jobs(&self, migration: &BatchedMigration) -> Vec<BatchedJob> {
        self.deps()
            .store
            .jobs_for_migration(migration.id)
            .await
            .expect("Failed to load jobs")
    }

    pub fn ranges(jobs: &[BatchedJob]) -> Vec<(i64, i64)> {
        jobs.iter()
            .map(|job| (job.min_cursor.first_value(), job.max_cursor.first_value()))
            .collect()
    }

    /// Keys of [`TABLE`] rows the migration has not touched yet
    pub fn unmigrated_keys(&self) -> Vec<Cursor> {
        self.engine
            .database
            .rows(TABLE)
            .into_iter()
            .filter(|(_, row)| row.get("migrated").is_none())
            .map(|(key, _)| key)
            .collect()
    }
}

// =============================================================================
// Postgres harness
// =============================================================================

/// Postgres container shared by all tests of one binary
struct SharedTestInfra {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        init_tracing();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Fresh pool on the shared Postgres container
pub struct PostgresHarness {
    pub db_pool: PgPool,
}

impl AsyncTestContext for PostgresHarness {
    async fn setup() -> Self {
        let infra = SharedTestInfra::get().await;
        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .expect("Failed to connect to test database");
        Self { db_pool }
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl PostgresHarness {
    /// `table` with `rows` rows: `id`, `title` and an empty `title_copy`
    pub async fn create_events_table(&self, table: &str, rows: i64) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE {} (id BIGSERIAL PRIMARY KEY, title TEXT NOT NULL, title_copy TEXT)",
            table
        ))
        .execute(&self.db_pool)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO {} (title) SELECT 'event ' || n FROM generate_series(1, $1) AS n",
            table
        ))
        .bind(rows)
        .execute(&self.db_pool)
        .await?;

        sqlx::query(&format!("ANALYZE {}", table))
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}
