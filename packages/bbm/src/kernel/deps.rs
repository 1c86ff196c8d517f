//! Engine dependencies (using traits for testability)
//!
//! Central container handed to every engine component. Production wiring uses
//! Postgres-backed implementations; tests use the doubles in
//! `kernel::test_dependencies` and the in-memory store.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::EngineSettings;
use crate::domains::batched_migrations::health_status::HealthIndicator;
use crate::domains::batched_migrations::postgres_store::PostgresMigrationStore;
use crate::domains::batched_migrations::registry::JobClassRegistry;
use crate::domains::batched_migrations::store::MigrationStore;
use crate::kernel::{
    BaseClock, BaseConnection, BaseErrorTracker, BaseMetricsSink, PgConnection, SystemClock,
    TracingErrorTracker,
};

#[derive(Clone)]
pub struct EngineDeps {
    /// Persistence of migrations, jobs and transition logs
    pub store: Arc<dyn MigrationStore>,
    /// Connection to the database holding the migrated tables
    pub connection: Arc<dyn BaseConnection>,
    pub clock: Arc<dyn BaseClock>,
    pub error_tracker: Arc<dyn BaseErrorTracker>,
    pub metrics: Arc<dyn BaseMetricsSink>,
    /// Job classes and batching strategies resolvable by name
    pub registry: Arc<JobClassRegistry>,
    /// Health indicators consulted before each execution
    pub indicators: Vec<Arc<dyn HealthIndicator>>,
    pub settings: EngineSettings,
}

impl EngineDeps {
    /// Production wiring on top of a Postgres pool
    pub fn postgres(
        pool: PgPool,
        registry: Arc<JobClassRegistry>,
        metrics: Arc<dyn BaseMetricsSink>,
        indicators: Vec<Arc<dyn HealthIndicator>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store: Arc::new(PostgresMigrationStore::new(pool.clone())),
            connection: Arc::new(PgConnection::new(pool)),
            clock: Arc::new(SystemClock),
            error_tracker: Arc::new(TracingErrorTracker),
            metrics,
            registry,
            indicators,
            settings,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
