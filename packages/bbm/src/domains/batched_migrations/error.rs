//! Error types of the batched migration engine.
//!
//! [`EngineError`] covers engine-level failures (invalid transitions, lookups,
//! finalization). [`JobError`] is what a job class returns from `perform`; it
//! classifies database timeouts so the engine can decide between retrying,
//! shrinking the sub-batch and splitting the batch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot {event} {record} in status {from}")]
    InvalidTransition {
        record: &'static str,
        from: String,
        event: &'static str,
    },

    #[error("unknown job class: {0}")]
    UnknownJobClass(String),

    #[error("unknown batching strategy: {0}")]
    UnknownBatchingStrategy(String),

    #[error("an unfinished batched migration already exists for {0}")]
    DuplicateMigration(String),

    #[error("{0}")]
    SplitAndRetry(String),

    #[error("{0}")]
    ReduceSubBatchSize(String),

    #[error(
        "Batched migration {0} could not be completed and a manual action is required. \
         Check the migration status for more details."
    )]
    FailedToFinalize(String),

    #[error("{record} {id} not found")]
    NotFound { record: &'static str, id: i64 },
}

/// Failure of a job class while processing its batch
#[derive(Debug, Error)]
pub enum JobError {
    #[error("canceling statement due to statement timeout: {0}")]
    StatementTimeout(String),

    #[error("canceling statement due to user request: {0}")]
    QueryCanceled(String),

    #[error("lock wait timeout: {0}")]
    LockWaitTimeout(String),

    #[error("timed out acquiring a connection: {0}")]
    ConnectionTimeout(String),

    /// Raised while processing one sub-batch; wraps the underlying failure
    #[error("sub-batch failed: {0}")]
    SubBatch(#[source] Box<JobError>),

    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl JobError {
    pub fn sub_batch(inner: JobError) -> Self {
        Self::SubBatch(Box::new(inner))
    }

    pub fn is_sub_batch(&self) -> bool {
        matches!(self, Self::SubBatch(_))
    }

    /// Timeout-class failures are the ones a smaller batch can fix
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::StatementTimeout(_)
            | Self::QueryCanceled(_)
            | Self::LockWaitTimeout(_)
            | Self::ConnectionTimeout(_) => true,
            Self::SubBatch(inner) => inner.is_timeout(),
            Self::Application(_) => false,
        }
    }

    /// Name recorded as `exception_class` in transition logs
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::StatementTimeout(_) => "StatementTimeout",
            Self::QueryCanceled(_) => "QueryCanceled",
            Self::LockWaitTimeout(_) => "LockWaitTimeout",
            Self::ConnectionTimeout(_) => "ConnectionTimeout",
            Self::SubBatch(_) => "SubBatchTimeout",
            Self::Application(_) => "ApplicationError",
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::PoolTimedOut) {
            return Self::ConnectionTimeout(err.to_string());
        }

        let classified = err.as_database_error().and_then(|db| {
            let message = db.message().to_string();
            let code = db.code()?;
            match &*code {
                "57014" if message.contains("statement timeout") => {
                    Some(Self::StatementTimeout(message))
                }
                "57014" => Some(Self::QueryCanceled(message)),
                "55P03" => Some(Self::LockWaitTimeout(message)),
                _ => None,
            }
        });

        classified.unwrap_or_else(|| Self::Application(err.into()))
    }
}
