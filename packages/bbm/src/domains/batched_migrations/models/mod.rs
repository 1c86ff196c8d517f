pub mod job;
pub mod migration;
pub mod transition_log;

pub use job::{next_job_status, BatchedJob, JobEvent, JobStatus, NewJob};
pub use migration::{
    next_migration_status, BatchedMigration, MigrationEvent, MigrationIdentity, MigrationStatus,
    NewMigration,
};
pub use transition_log::{JobTransitionLog, NewTransitionLog};
