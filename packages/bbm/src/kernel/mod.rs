// Kernel - infrastructure shared by the engine and the binaries

pub mod deps;
pub mod error_tracking;
pub mod pg_connection;
pub mod scheduled_tasks;
pub mod task_queue;
pub mod test_dependencies;
pub mod traits;

pub use deps::EngineDeps;
pub use error_tracking::TracingErrorTracker;
pub use pg_connection::PgConnection;
pub use task_queue::{ChannelTaskQueue, MigrationTask, SharedTaskReceiver, TaskQueue};
pub use test_dependencies::{
    InMemoryDatabase, MockClock, RecordingTaskQueue, SpyErrorTracker, SpyMetricsSink,
    TestDependencies,
};
pub use traits::*;
