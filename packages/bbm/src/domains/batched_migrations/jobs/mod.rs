//! Job classes bundled with the engine.

pub mod copy_column;

pub use copy_column::{CopyColumnJob, COPY_COLUMN_JOB};

use super::registry::JobClassRegistry;

/// Register every bundled job class
pub fn register_bundled_jobs(registry: &mut JobClassRegistry) {
    registry.register(COPY_COLUMN_JOB, CopyColumnJob::new);
}
