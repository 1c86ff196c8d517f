//! Batched background migrations.
//!
//! A migration rewrites one table in contiguous key ranges (jobs). The
//! scheduler runs at most one job per migration per tick, gated by database
//! health; failing jobs are retried, their sub-batches shrunk or their ranges
//! split; the optimizer keeps job duration close to the migration interval.

pub mod batching_strategy;
pub mod error;
pub mod health_status;
pub mod job_class;
pub mod jobs;
pub mod memory_store;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod postgres_store;
pub mod registration;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod worker;
pub mod wrapper;

pub use batching_strategy::{BatchingStrategy, PrimaryKeyBatchingStrategy};
pub use error::{EngineError, JobError};
pub use health_status::{HealthIndicator, Signal, SignalKind};
pub use job_class::{BatchMetrics, BatchedMigrationJob, JobArguments};
pub use memory_store::InMemoryMigrationStore;
pub use metrics::PrometheusMetrics;
pub use models::*;
pub use optimizer::BatchOptimizer;
pub use postgres_store::PostgresMigrationStore;
pub use registration::{queue_batched_background_migration, QueueMigration};
pub use registry::JobClassRegistry;
pub use runner::{MigrationOutcome, RunOptions, Runner};
pub use scheduler::Scheduler;
pub use store::{JobCounts, MigrationStore};
pub use worker::TaskWorker;
